//! Scheduler error types

use thiserror::Error;

/// Configuration values the scheduler refuses to run with
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    NonPositive(&'static str),

    #[error("Invalid context id prefix '{0}'")]
    InvalidPrefix(String),

    #[error("Invalid context id '{0}': must be non-empty and contain no '.' or path separators")]
    InvalidContextId(String),
}

/// Errors surfaced by the scheduler API
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Operation was dropped before it completed")]
    Abandoned,
}
