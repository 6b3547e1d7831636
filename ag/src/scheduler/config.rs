//! Scheduler configuration

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::ConfigError;

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Global pause switch; nothing is dispatched while false
    #[serde(default = "default_active")]
    pub active: bool,

    /// Max dispatches per rate window
    #[serde(default = "default_rate")]
    pub rate: u32,

    /// Rate window duration in milliseconds
    #[serde(default = "default_rate_per_ms")]
    pub rate_per_ms: u64,

    /// Max operations in flight at once
    #[serde(default = "default_concurrent")]
    pub concurrent: usize,

    /// Aggregate the in-flight count across contexts through the shared store
    #[serde(default)]
    pub across_contexts: bool,

    /// Key prefix for context entries in the shared store
    #[serde(default = "default_context_id_prefix")]
    pub context_id_prefix: String,

    /// Entries of other contexts idle for longer than this are considered dead
    #[serde(default = "default_context_expire_ms")]
    pub context_expire_ms: u64,

    /// Suffix of this context's own key; defaults to the process context id
    #[serde(default)]
    pub context_id: Option<String>,

    /// Remove stale entries of other contexts when the scheduler starts
    #[serde(default)]
    pub sweep_on_start: bool,

    /// Unrecognized options, kept verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn default_active() -> bool {
    true
}

fn default_rate() -> u32 {
    5
}

fn default_rate_per_ms() -> u64 {
    1_000
}

fn default_concurrent() -> usize {
    2
}

fn default_context_id_prefix() -> String {
    "admitgate".to_string()
}

fn default_context_expire_ms() -> u64 {
    20_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            active: default_active(),
            rate: default_rate(),
            rate_per_ms: default_rate_per_ms(),
            concurrent: default_concurrent(),
            across_contexts: false,
            context_id_prefix: default_context_id_prefix(),
            context_expire_ms: default_context_expire_ms(),
            context_id: None,
            sweep_on_start: false,
            extra: BTreeMap::new(),
        }
    }
}

impl SchedulerConfig {
    /// Get the rate window as a Duration
    pub fn rate_per(&self) -> Duration {
        Duration::from_millis(self.rate_per_ms)
    }

    /// Get the staleness threshold as a Duration
    pub fn context_expire(&self) -> Duration {
        Duration::from_millis(self.context_expire_ms)
    }

    /// Reject values the scheduler cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate == 0 {
            return Err(ConfigError::NonPositive("rate"));
        }
        if self.rate_per_ms == 0 {
            return Err(ConfigError::NonPositive("rate_per_ms"));
        }
        if self.concurrent == 0 {
            return Err(ConfigError::NonPositive("concurrent"));
        }
        if self.context_expire_ms == 0 {
            return Err(ConfigError::NonPositive("context_expire_ms"));
        }
        if self.context_id_prefix.is_empty() || self.context_id_prefix.starts_with('.') {
            return Err(ConfigError::InvalidPrefix(self.context_id_prefix.clone()));
        }
        if self.context_id_prefix.contains(['/', '\\']) {
            return Err(ConfigError::InvalidPrefix(self.context_id_prefix.clone()));
        }
        if let Some(id) = &self.context_id {
            if id.is_empty() || id.contains(['.', '/', '\\']) {
                return Err(ConfigError::InvalidContextId(id.clone()));
            }
        }
        Ok(())
    }

    /// Apply every option that is set, returning the merged configuration
    pub fn merge(&self, options: &SchedulerOptions) -> SchedulerConfig {
        let mut merged = self.clone();
        if let Some(active) = options.active {
            merged.active = active;
        }
        if let Some(rate) = options.rate {
            merged.rate = rate;
        }
        if let Some(rate_per_ms) = options.rate_per_ms {
            merged.rate_per_ms = rate_per_ms;
        }
        if let Some(concurrent) = options.concurrent {
            merged.concurrent = concurrent;
        }
        if let Some(across) = options.across_contexts {
            merged.across_contexts = across;
        }
        if let Some(prefix) = &options.context_id_prefix {
            merged.context_id_prefix = prefix.clone();
        }
        if let Some(expire) = options.context_expire_ms {
            merged.context_expire_ms = expire;
        }
        if let Some(id) = &options.context_id {
            merged.context_id = Some(id.clone());
        }
        if let Some(sweep) = options.sweep_on_start {
            merged.sweep_on_start = sweep;
        }
        for (key, value) in &options.extra {
            merged.extra.insert(key.clone(), value.clone());
        }
        merged
    }
}

/// A partial configuration; unset fields leave the current value alone
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_per_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrent: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub across_contexts: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_expire_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sweep_on_start: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl SchedulerOptions {
    /// Options that only toggle the pause switch
    pub fn active(active: bool) -> Self {
        Self {
            active: Some(active),
            ..Default::default()
        }
    }
}
