//! Event surface for scheduler observers
//!
//! Every admission and completion emits an event. Observers (the CLI, the file
//! logger, tests) subscribe to the kinds they care about.
//!
//! # Architecture
//!
//! ```text
//!   Scheduler::next ──► Sent
//!   completion      ──► Error (only when someone listens) ─► Received ─► Drained
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        EVENT BUS                             │
//! │            (tokio::sync::broadcast channel)                  │
//! └─────────────────────────────────────────────────────────────┘
//!         ↓                      ↓                     ↓
//!   ┌───────────┐         ┌───────────┐         ┌───────────┐
//!   │ CLI live  │         │ File log  │         │  Tests    │
//!   │ output    │         │ .jsonl    │         │           │
//!   └───────────┘         └───────────┘         └───────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use admitgate::events::{EventBus, EventKind};
//!
//! let bus = EventBus::with_default_capacity();
//! let mut errors = bus.subscribe_to(&[EventKind::Error]);
//! while let Ok(event) = errors.recv().await {
//!     println!("failed: {:?}", event);
//! }
//! ```

mod bus;
mod logger;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, Subscription, create_event_bus};
pub use logger::{EventLogger, read_events, spawn_event_logger};
pub use types::{EventKind, EventLogEntry, SchedulerEvent};
