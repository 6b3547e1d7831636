//! Wrapping operations so they start only once admitted

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::{debug, error};

use super::core::Scheduler;
use super::error::SchedulerError;
use super::queue::{BeginFn, PendingRequest};

/// An operation held back until the scheduler admits it
///
/// Nothing runs until the request is enqueued with [`end`](Self::end) or
/// [`send`](Self::send). Dropping an `Intercepted` never starts the operation.
pub struct Intercepted<F> {
    scheduler: Scheduler,
    lane: Option<String>,
    operation: F,
}

impl<F> Intercepted<F> {
    pub(crate) fn new(scheduler: Scheduler, operation: F) -> Self {
        Self {
            scheduler,
            lane: None,
            operation,
        }
    }

    /// Serialize with other requests on `lane`
    pub fn lane(mut self, lane: impl Into<String>) -> Self {
        self.lane = Some(lane.into());
        self
    }

    /// Set or clear the lane
    pub fn with_lane(mut self, lane: Option<String>) -> Self {
        self.lane = lane;
        self
    }
}

impl<F, T, E> Intercepted<F>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    /// Build the queue entry without enqueueing it
    ///
    /// Once dispatched, the operation runs on its own task. Completion is
    /// reported to the scheduler before `callback` sees the result.
    pub fn into_request<C>(self, callback: C) -> PendingRequest
    where
        C: FnOnce(Result<T, E>) + Send + 'static,
    {
        let lane = self.lane.clone();
        let operation = self.operation;

        let begin: BeginFn = Box::new(move |scheduler: Scheduler, request_id: u64| {
            tokio::spawn(async move {
                match AssertUnwindSafe(operation).catch_unwind().await {
                    Ok(result) => {
                        let failure = result.as_ref().err().map(|e| e.to_string());
                        scheduler.complete(request_id, failure);
                        callback(result);
                    }
                    Err(_) => {
                        error!(request_id, "Operation panicked");
                        scheduler.complete(request_id, Some("operation panicked".to_string()));
                    }
                }
            });
        });

        PendingRequest::new(lane, begin)
    }

    /// Enqueue; `callback` receives the operation's result
    pub fn end<C>(self, callback: C)
    where
        C: FnOnce(Result<T, E>) + Send + 'static,
    {
        let scheduler = self.scheduler.clone();
        debug!(lane = ?self.lane, "Intercepted::end: called");
        scheduler.enqueue(self.into_request(callback));
    }

    /// Enqueue now and return a future for the operation's result
    ///
    /// The outer error is [`SchedulerError::Abandoned`] if the operation
    /// panicked or its task was cancelled.
    pub fn send(self) -> impl Future<Output = Result<Result<T, E>, SchedulerError>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.end(move |result| {
            // Receiver gone means the caller stopped waiting
            let _ = tx.send(result);
        });
        async move { rx.await.map_err(|_| SchedulerError::Abandoned) }
    }
}
