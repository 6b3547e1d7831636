//! CLI command definitions and subcommands

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::scheduler::SchedulerOptions;

/// admitgate - admission control for outbound operations
#[derive(Debug, Parser)]
#[command(
    name = "ag",
    about = "Run operations through a rate, concurrency and lane aware admission scheduler",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Shared store directory for cross-context accounting
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run simulated operations through the scheduler
    Simulate(SimulateArgs),

    /// Fetch URLs through the scheduler
    Fetch {
        /// URLs to GET
        #[arg(required = true)]
        urls: Vec<String>,

        /// Serialize requests to the same host
        #[arg(long)]
        lane_per_host: bool,

        #[command(flatten)]
        scheduler: SchedulerArgs,
    },

    /// List context entries in the shared store
    Contexts,
}

#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// Number of operations to run
    #[arg(short = 'n', long, default_value_t = 10)]
    pub requests: usize,

    /// Lanes assigned round-robin (comma separated); none means unlaned
    #[arg(long, value_delimiter = ',')]
    pub lanes: Vec<String>,

    /// Base duration of each operation
    #[arg(long, default_value_t = 200)]
    pub duration_ms: u64,

    /// Fail every K-th operation
    #[arg(long)]
    pub fail_every: Option<usize>,

    /// Start paused and resume after this many milliseconds
    #[arg(long, value_name = "MS")]
    pub paused: Option<u64>,

    /// Write events as JSON lines (to PATH, or a new file in the data dir)
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    pub event_log: Option<Option<PathBuf>>,

    #[command(flatten)]
    pub scheduler: SchedulerArgs,
}

/// Scheduler overrides shared by the run commands
#[derive(Debug, Default, Args)]
pub struct SchedulerArgs {
    /// Dispatches allowed per window
    #[arg(long)]
    pub rate: Option<u32>,

    /// Window length in milliseconds
    #[arg(long)]
    pub rate_per_ms: Option<u64>,

    /// Maximum in-flight operations
    #[arg(long)]
    pub concurrent: Option<usize>,

    /// Aggregate concurrency with other processes through the shared store
    #[arg(long)]
    pub across_contexts: bool,

    /// Context id for this process's shared store entry
    #[arg(long)]
    pub context_id: Option<String>,
}

impl SchedulerArgs {
    /// Overrides for the file configuration; unset flags change nothing
    pub fn to_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            rate: self.rate,
            rate_per_ms: self.rate_per_ms,
            concurrent: self.concurrent,
            across_contexts: self.across_contexts.then_some(true),
            context_id: self.context_id.clone(),
            ..Default::default()
        }
    }
}
