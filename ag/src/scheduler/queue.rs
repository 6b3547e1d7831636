//! Queue types for the scheduler

use std::fmt;

use tokio::time::Instant;

use super::core::Scheduler;

/// Starts the underlying operation; receives the scheduler and the request id
/// it must report completion for
pub(crate) type BeginFn = Box<dyn FnOnce(Scheduler, u64) + Send>;

/// A request waiting for admission
///
/// Built by [`Intercepted::into_request`](super::Intercepted::into_request);
/// owned by the queue until dispatched.
pub struct PendingRequest {
    pub(crate) lane: Option<String>,
    pub(crate) begin: BeginFn,
    pub(crate) id: u64,
    pub(crate) enqueued_at: Option<Instant>,
}

impl PendingRequest {
    pub(crate) fn new(lane: Option<String>, begin: BeginFn) -> Self {
        Self {
            lane,
            begin,
            id: 0,
            enqueued_at: None,
        }
    }

    /// Serial lane of this request, if any
    pub fn lane(&self) -> Option<&str> {
        self.lane.as_deref()
    }

    /// Id assigned at enqueue time (0 before)
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("lane", &self.lane)
            .field("enqueued_at", &self.enqueued_at)
            .finish_non_exhaustive()
    }
}

/// Why a scheduling pass did not admit anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocked {
    /// Scheduler is paused
    Paused,
    /// In-flight ceiling reached
    Concurrency,
    /// Rate window is full
    Rate,
    /// Nothing queued
    Empty,
    /// Every queued request waits on a busy lane
    Lane,
}

/// Result of a single scheduling pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A request was dispatched
    Admitted { request_id: u64 },
    /// Nothing could be dispatched
    Blocked(Blocked),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

/// Statistics for the scheduler
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SchedulerStats {
    pub total_enqueued: u64,
    pub total_dispatched: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    /// Times a re-evaluation timer was armed because of the rate window
    pub total_rate_limited: u64,
    pub total_wait_time_ms: u64,
    pub peak_queue_depth: usize,
    pub peak_concurrent: u64,
}

/// Snapshot of scheduler state for display
#[derive(Debug, Clone)]
pub struct QueueState {
    pub queued: usize,
    pub in_flight: u64,
    pub concurrency: u64,
    pub active: bool,
    pub rate_bound: bool,
    pub serial_bound: bool,
    pub busy_lanes: Vec<String>,
    pub timer_armed: bool,
    pub stats: SchedulerStats,
}
