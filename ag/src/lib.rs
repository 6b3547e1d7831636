//! admitgate - client-side admission control for outbound operations
//!
//! Operations are wrapped by a [`Scheduler`] and started only when three
//! independent constraints allow it:
//!
//! - **Rate window**: at most `rate` dispatches per rolling `rate_per_ms`
//! - **Concurrency ceiling**: at most `concurrent` operations in flight, optionally
//!   counted across every process sharing a [`sharedstore`] directory
//! - **Serial lanes**: at most one in-flight operation per named lane
//!
//! Waiting is data, not a suspended task: blocked requests sit in a FIFO queue
//! and each completion (or the rate timer) runs another admission pass.
//!
//! # Modules
//!
//! - [`scheduler`] - Admission queue, rate window, counters, lanes
//! - [`events`] - Lifecycle notifications and the JSONL event log
//! - [`workload`] - Simulated and HTTP operations for the CLI
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod events;
pub mod scheduler;
pub mod workload;

pub use config::Config;
pub use events::{EventBus, EventKind, SchedulerEvent, Subscription};
pub use scheduler::{Intercepted, Scheduler, SchedulerConfig, SchedulerError, SchedulerOptions};
