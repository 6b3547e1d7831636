//! Admission scheduler for outbound operations
//!
//! Wrapped operations wait in a FIFO queue until three gates agree: the
//! sliding rate window, the in-flight ceiling (optionally shared by every
//! context using the same store) and the request's serial lane.

mod concurrency;
mod config;
mod core;
mod error;
mod intercept;
mod lanes;
mod queue;
mod window;

pub use concurrency::{ContextEntry, ConcurrencyCounter, process_context_id, read_entries};
pub use config::{SchedulerConfig, SchedulerOptions};
pub use core::Scheduler;
pub use error::{ConfigError, SchedulerError};
pub use intercept::Intercepted;
pub use lanes::LaneManager;
pub use queue::{Admission, Blocked, PendingRequest, QueueState, SchedulerStats};
pub use window::RateWindow;
