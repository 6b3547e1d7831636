//! Scheduler implementation

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use sharedstore::SharedStore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::events::{EventBus, EventKind, SchedulerEvent, Subscription, create_event_bus};

use super::concurrency::ConcurrencyCounter;
use super::config::{SchedulerConfig, SchedulerOptions};
use super::error::SchedulerError;
use super::intercept::Intercepted;
use super::lanes::LaneManager;
use super::queue::{Admission, Blocked, PendingRequest, QueueState, SchedulerStats};
use super::window::RateWindow;

/// A dispatched request awaiting completion
struct InFlight {
    lane: Option<String>,
}

/// Internal state protected by mutex
struct SchedulerInner {
    config: SchedulerConfig,

    /// Requests waiting for admission, in arrival order
    queue: VecDeque<PendingRequest>,

    /// Dispatched requests by id
    in_flight: HashMap<u64, InFlight>,

    /// Dispatch timestamps for rate limiting (sliding window)
    window: RateWindow,

    lanes: LaneManager,
    counter: ConcurrencyCounter,

    /// Pending re-evaluation while rate-bound, and when it fires
    timer: Option<JoinHandle<()>>,
    timer_deadline: Option<Instant>,

    next_id: u64,
    closed: bool,
    stats: SchedulerStats,
}

struct Shared {
    inner: Mutex<SchedulerInner>,
    events: Arc<EventBus>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        inner.counter.detach();
    }
}

/// Admission controller for outbound operations
///
/// Decides for each queued request whether it may be dispatched now, given
/// the rate window, the in-flight ceiling and the request's serial lane. The
/// handle is cheap to clone; all clones drive the same queue.
///
/// Dispatch and the rate timer spawn tokio tasks, so the scheduler must be
/// driven from within a tokio runtime.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Create a new scheduler with the given configuration
    ///
    /// `store` is required for cross-context accounting; without one,
    /// `across_contexts` is forced off.
    pub fn new(config: SchedulerConfig, store: Option<Arc<dyn SharedStore>>) -> Result<Self, SchedulerError> {
        Self::with_event_bus(config, store, create_event_bus())
    }

    /// Create a new scheduler emitting onto an existing event bus
    pub fn with_event_bus(
        mut config: SchedulerConfig,
        store: Option<Arc<dyn SharedStore>>,
        events: Arc<EventBus>,
    ) -> Result<Self, SchedulerError> {
        debug!(?config, has_store = store.is_some(), "Scheduler::new: called");
        config.validate()?;

        if config.across_contexts && store.is_none() {
            warn!("Cross-context accounting requested without a shared store; disabling");
            config.across_contexts = false;
        }

        let mut counter = ConcurrencyCounter::new(&config, store);
        counter.init(config.sweep_on_start);
        info!(
            rate = config.rate,
            rate_per_ms = config.rate_per_ms,
            concurrent = config.concurrent,
            across_contexts = counter.is_shared(),
            context_key = counter.own_key(),
            "Scheduler started"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(SchedulerInner {
                    config,
                    queue: VecDeque::new(),
                    in_flight: HashMap::new(),
                    window: RateWindow::new(),
                    lanes: LaneManager::new(),
                    counter,
                    timer: None,
                    timer_deadline: None,
                    next_id: 1,
                    closed: false,
                    stats: SchedulerStats::default(),
                }),
                events,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerInner> {
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The bus this scheduler emits on
    pub fn events(&self) -> &Arc<EventBus> {
        &self.shared.events
    }

    /// Subscribe to every event kind
    pub fn subscribe(&self) -> Subscription {
        self.shared.events.subscribe()
    }

    /// Subscribe to the named event kinds
    pub fn subscribe_to(&self, kinds: &[EventKind]) -> Subscription {
        self.shared.events.subscribe_to(kinds)
    }

    /// Current configuration
    pub fn config(&self) -> SchedulerConfig {
        self.lock().config.clone()
    }

    /// Wrap an operation so that it is started only once admitted
    pub fn intercept<F>(&self, operation: F) -> Intercepted<F> {
        Intercepted::new(self.clone(), operation)
    }

    /// Queue a request and run a scheduling pass
    pub fn enqueue(&self, request: PendingRequest) {
        self.cycle(Some(request));
    }

    /// Append `request` (if any), then admit as much as capacity allows
    ///
    /// Runs synchronously to a fixed point. If the pass ends blocked by the
    /// rate window, a one-shot timer re-runs it once the window frees up.
    pub fn cycle(&self, request: Option<PendingRequest>) {
        let mut guard = self.lock();
        self.cycle_locked(&mut guard, request);
    }

    fn cycle_locked(&self, inner: &mut SchedulerInner, request: Option<PendingRequest>) {
        if let Some(mut request) = request {
            request.id = inner.next_id;
            request.enqueued_at = Some(Instant::now());
            inner.next_id += 1;
            debug!(request_id = request.id, lane = ?request.lane, "Scheduler::cycle: enqueued");
            inner.queue.push_back(request);
            inner.stats.total_enqueued += 1;
            inner.stats.peak_queue_depth = inner.stats.peak_queue_depth.max(inner.queue.len());
        }

        let previous_deadline = cancel_timer(inner);

        let mut admitted = 0;
        while self.next_locked(inner).is_admitted() {
            admitted += 1;
        }

        let now = Instant::now();
        let rate = inner.config.rate;
        let rate_per = inner.config.rate_per();
        if inner.window.is_bound(now, rate, rate_per, !inner.queue.is_empty()) {
            let delay = inner.window.retry_after(now, rate, rate_per);
            let deadline = now + delay;
            debug!(?delay, queued = inner.queue.len(), "Scheduler::cycle: rate-bound, arming timer");
            // Re-arming for the same expiry is not a new rate-limited episode
            if previous_deadline != Some(deadline) {
                inner.stats.total_rate_limited += 1;
            }
            inner.timer = Some(self.arm_timer(delay));
            inner.timer_deadline = Some(deadline);
        }

        debug!(admitted, queued = inner.queue.len(), "Scheduler::cycle: done");
    }

    fn arm_timer(&self, delay: std::time::Duration) -> JoinHandle<()> {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                debug!("Scheduler: rate timer fired");
                Scheduler { shared }.cycle(None);
            }
        })
    }

    /// Run a single scheduling pass
    pub fn next(&self) -> Admission {
        let mut guard = self.lock();
        self.next_locked(&mut guard)
    }

    fn next_locked(&self, inner: &mut SchedulerInner) -> Admission {
        let config = &inner.config;
        inner.window.trim(config.rate);

        if !config.active {
            return Admission::Blocked(Blocked::Paused);
        }
        if inner.counter.current() >= config.concurrent as u64 {
            return Admission::Blocked(Blocked::Concurrency);
        }
        let now = Instant::now();
        if inner
            .window
            .is_bound(now, config.rate, config.rate_per(), !inner.queue.is_empty())
        {
            return Admission::Blocked(Blocked::Rate);
        }
        if inner.queue.is_empty() {
            return Admission::Blocked(Blocked::Empty);
        }

        let lanes = &inner.lanes;
        let position = inner
            .queue
            .iter()
            .position(|request| request.lane.as_deref().is_none_or(|lane| lanes.is_free(lane)));
        let Some(request) = position.and_then(|index| inner.queue.remove(index)) else {
            debug!(queued = inner.queue.len(), "Scheduler::next: every queued request waits on a busy lane");
            inner.lanes.mark_serial_bound();
            return Admission::Blocked(Blocked::Lane);
        };

        let request_id = request.id;
        if let Some(lane) = &request.lane {
            inner.lanes.set_state(lane, true);
        }
        inner.window.record(now);
        inner.counter.adjust(1);
        inner.in_flight.insert(
            request_id,
            InFlight {
                lane: request.lane.clone(),
            },
        );

        inner.stats.total_dispatched += 1;
        if let Some(enqueued_at) = request.enqueued_at {
            inner.stats.total_wait_time_ms += now.saturating_duration_since(enqueued_at).as_millis() as u64;
        }
        inner.stats.peak_concurrent = inner.stats.peak_concurrent.max(inner.counter.own_count());

        debug!(request_id, lane = ?request.lane, "Scheduler::next: dispatching");
        let lane = request.lane.clone();
        (request.begin)(self.clone(), request_id);
        self.shared.events.emit(SchedulerEvent::Sent { request_id, lane });

        Admission::Admitted { request_id }
    }

    /// Completion hook, run before the caller's own callback
    pub(crate) fn complete(&self, request_id: u64, failure: Option<String>) {
        debug!(request_id, failed = failure.is_some(), "Scheduler::complete: called");
        let mut guard = self.lock();
        let inner = &mut *guard;

        let Some(done) = inner.in_flight.remove(&request_id) else {
            warn!(request_id, "Completion for a request that is not in flight; ignoring");
            return;
        };

        inner.counter.adjust(-1);
        inner.stats.total_completed += 1;

        let events = &self.shared.events;
        let success = failure.is_none();
        if let Some(message) = failure {
            inner.stats.total_failed += 1;
            if events.has_listeners(EventKind::Error) {
                events.emit(SchedulerEvent::Error {
                    request_id,
                    lane: done.lane.clone(),
                    message,
                });
            } else {
                debug!(request_id, %message, "Scheduler::complete: failure with no error listeners");
            }
        }

        events.emit(SchedulerEvent::Received {
            request_id,
            lane: done.lane.clone(),
            success,
        });

        if inner.queue.is_empty() && inner.counter.current() == 0 {
            debug!("Scheduler::complete: drained");
            events.emit(SchedulerEvent::Drained);
        }

        if let Some(lane) = &done.lane {
            inner.lanes.set_state(lane, false);
        }

        self.cycle_locked(inner, None);
    }

    /// Apply configuration changes and run a scheduling pass
    ///
    /// Invalid merged configurations are rejected and leave the current one in
    /// place.
    pub fn reconfigure(&self, options: &SchedulerOptions) -> Result<(), SchedulerError> {
        debug!(?options, "Scheduler::reconfigure: called");
        let mut guard = self.lock();
        let inner = &mut *guard;

        let mut merged = inner.config.merge(options);
        merged.validate()?;
        if merged.across_contexts && !inner.counter.has_store() {
            warn!("Cross-context accounting requested without a shared store; disabling");
            merged.across_contexts = false;
        }

        if merged != inner.config {
            info!(
                active = merged.active,
                rate = merged.rate,
                rate_per_ms = merged.rate_per_ms,
                concurrent = merged.concurrent,
                "Scheduler reconfigured"
            );
            inner.counter.reconfigure(&merged);
            inner.config = merged;
        }

        self.cycle_locked(inner, None);
        Ok(())
    }

    /// Pause or resume dispatching
    pub fn set_active(&self, active: bool) {
        if let Err(e) = self.reconfigure(&SchedulerOptions::active(active)) {
            warn!(active, error = %e, "Failed to toggle dispatching");
        }
    }

    /// In-flight count as used for admission (aggregate in cross-context mode)
    pub fn current_concurrency_level(&self) -> u64 {
        self.lock().counter.current()
    }

    /// Number of requests waiting
    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    /// Get current queue state
    pub fn queue_state(&self) -> QueueState {
        let inner = self.lock();
        let now = Instant::now();
        QueueState {
            queued: inner.queue.len(),
            in_flight: inner.in_flight.len() as u64,
            concurrency: inner.counter.current(),
            active: inner.config.active,
            rate_bound: inner.window.is_bound(
                now,
                inner.config.rate,
                inner.config.rate_per(),
                !inner.queue.is_empty(),
            ),
            serial_bound: inner.lanes.serial_bound(),
            busy_lanes: inner.lanes.busy_lanes(),
            timer_armed: inner.timer.as_ref().is_some_and(|t| !t.is_finished()),
            stats: inner.stats.clone(),
        }
    }

    /// Get the scheduler statistics
    pub fn stats(&self) -> SchedulerStats {
        self.lock().stats.clone()
    }

    /// Stop the timer and leave the shared store
    ///
    /// This scheduler's share of the context entry is released (the entry
    /// itself goes with the last scheduler using it). Queued requests stay
    /// queued; later passes admit them with local accounting only, still
    /// counting operations that were in flight at close time.
    pub fn close(&self) {
        debug!("Scheduler::close: called");
        let mut inner = self.lock();
        cancel_timer(&mut inner);
        if !inner.closed {
            inner.counter.detach();
            inner.closed = true;
        }
    }
}

/// Abort the pending timer, if any, returning its deadline
///
/// Aborting a timer that already fired or was already aborted is a no-op.
fn cancel_timer(inner: &mut SchedulerInner) -> Option<Instant> {
    if let Some(timer) = inner.timer.take() {
        timer.abort();
    }
    inner.timer_deadline.take()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    type Done = oneshot::Sender<Result<u64, String>>;

    fn config(rate: u32, rate_per_ms: u64, concurrent: usize) -> SchedulerConfig {
        SchedulerConfig {
            rate,
            rate_per_ms,
            concurrent,
            ..Default::default()
        }
    }

    /// Enqueue an operation that completes when the returned sender fires
    fn pending(scheduler: &Scheduler, lane: Option<&str>) -> Done {
        let (tx, rx) = oneshot::channel::<Result<u64, String>>();
        scheduler
            .intercept(async move { rx.await.unwrap_or_else(|_| Err("dropped".to_string())) })
            .with_lane(lane.map(str::to_string))
            .end(|_| {});
        tx
    }

    fn sent_ids(events: &[SchedulerEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                SchedulerEvent::Sent { request_id, .. } => Some(*request_id),
                _ => None,
            })
            .collect()
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let result = Scheduler::new(config(0, 1000, 1), None);
        assert!(matches!(result, Err(SchedulerError::Config(_))));
    }

    #[tokio::test]
    async fn test_across_contexts_forced_off_without_store() {
        let scheduler = Scheduler::new(
            SchedulerConfig {
                across_contexts: true,
                ..Default::default()
            },
            None,
        )
        .unwrap();
        assert!(!scheduler.config().across_contexts);
    }

    #[tokio::test]
    async fn test_concurrent_limit() {
        let scheduler = Scheduler::new(config(100, 1000, 2), None).unwrap();

        let a = pending(&scheduler, None);
        let _b = pending(&scheduler, None);
        let _c = pending(&scheduler, None);

        let state = scheduler.queue_state();
        assert_eq!(state.in_flight, 2);
        assert_eq!(state.queued, 1);
        assert_eq!(scheduler.next(), Admission::Blocked(Blocked::Concurrency));

        // Completing one admits the third
        a.send(Ok(1)).unwrap();
        settle().await;

        let state = scheduler.queue_state();
        assert_eq!(state.in_flight, 2);
        assert_eq!(state.queued, 0);
        assert_eq!(state.stats.peak_concurrent, 2);
    }

    #[tokio::test]
    async fn test_fifo_for_unlaned_requests() {
        let scheduler = Scheduler::new(config(u32::MAX, 1000, 1), None).unwrap();
        let mut sub = scheduler.subscribe_to(&[EventKind::Sent]);

        let r1 = pending(&scheduler, None);
        let r2 = pending(&scheduler, None);
        let r3 = pending(&scheduler, None);

        r1.send(Ok(1)).unwrap();
        settle().await;
        r2.send(Ok(2)).unwrap();
        settle().await;
        r3.send(Ok(3)).unwrap();
        settle().await;

        assert_eq!(sent_ids(&sub.drain()), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_lane_serialization() {
        let scheduler = Scheduler::new(config(u32::MAX, 1000, 10), None).unwrap();
        let mut sub = scheduler.subscribe_to(&[EventKind::Sent]);

        let first = pending(&scheduler, Some("uploads"));
        let _second = pending(&scheduler, Some("uploads"));
        let _other = pending(&scheduler, Some("downloads"));
        let _free = pending(&scheduler, None);

        // The second upload waits; later requests on other lanes pass it
        assert_eq!(sent_ids(&sub.drain()), vec![1, 3, 4]);
        let state = scheduler.queue_state();
        assert_eq!(state.queued, 1);
        assert!(state.serial_bound);
        assert_eq!(state.busy_lanes, vec!["downloads".to_string(), "uploads".to_string()]);

        first.send(Ok(0)).unwrap();
        settle().await;
        assert_eq!(sent_ids(&sub.drain()), vec![2]);
        assert!(!scheduler.queue_state().serial_bound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_window_timer() {
        let scheduler = Scheduler::new(config(2, 1000, 10), None).unwrap();
        let mut sub = scheduler.subscribe_to(&[EventKind::Sent]);

        let _r1 = pending(&scheduler, None);
        let _r2 = pending(&scheduler, None);
        let _r3 = pending(&scheduler, None);

        assert_eq!(sent_ids(&sub.drain()), vec![1, 2]);
        let state = scheduler.queue_state();
        assert!(state.rate_bound);
        assert!(state.timer_armed);
        assert_eq!(state.stats.total_rate_limited, 1);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        settle().await;
        assert!(sub.drain().is_empty());

        tokio::time::sleep(Duration::from_millis(2)).await;
        settle().await;
        assert_eq!(sent_ids(&sub.drain()), vec![3]);
        assert!(!scheduler.queue_state().timer_armed);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let scheduler = Scheduler::new(
            SchedulerConfig {
                active: false,
                ..config(10, 1000, 10)
            },
            None,
        )
        .unwrap();
        let mut sub = scheduler.subscribe_to(&[EventKind::Sent]);

        let _a = pending(&scheduler, None);
        let _b = pending(&scheduler, None);
        assert_eq!(scheduler.next(), Admission::Blocked(Blocked::Paused));
        assert!(sub.drain().is_empty());

        scheduler.set_active(true);
        assert_eq!(sent_ids(&sub.drain()), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_completion_events_and_drain() {
        let scheduler = Scheduler::new(config(10, 1000, 10), None).unwrap();
        let mut sub = scheduler.subscribe();

        let done = pending(&scheduler, None);
        done.send(Err("boom".to_string())).unwrap();
        settle().await;

        let events = sub.drain();
        let types: Vec<_> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec!["sent", "error", "received", "drained"]);
        assert!(matches!(
            &events[1],
            SchedulerEvent::Error { message, .. } if message == "boom"
        ));

        let stats = scheduler.stats();
        assert_eq!(stats.total_completed, 1);
        assert_eq!(stats.total_failed, 1);
        assert_eq!(scheduler.current_concurrency_level(), 0);
    }

    #[tokio::test]
    async fn test_error_not_emitted_without_listeners() {
        let scheduler = Scheduler::new(config(10, 1000, 10), None).unwrap();
        let mut sub = scheduler.subscribe_to(&[EventKind::Received]);

        let done = pending(&scheduler, None);
        done.send(Err("boom".to_string())).unwrap();
        settle().await;

        assert_eq!(
            sub.drain(),
            vec![SchedulerEvent::Received {
                request_id: 1,
                lane: None,
                success: false
            }]
        );
        assert!(!scheduler.events().has_listeners(EventKind::Error));
    }

    #[tokio::test]
    async fn test_reconfigure_raises_concurrency() {
        let scheduler = Scheduler::new(config(100, 1000, 1), None).unwrap();
        let _a = pending(&scheduler, None);
        let _b = pending(&scheduler, None);
        assert_eq!(scheduler.queued(), 1);

        scheduler
            .reconfigure(&SchedulerOptions {
                concurrent: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(scheduler.queued(), 0);
        assert_eq!(scheduler.config().concurrent, 2);
    }

    #[tokio::test]
    async fn test_reconfigure_rejects_invalid_and_keeps_old() {
        let scheduler = Scheduler::new(config(3, 1000, 1), None).unwrap();
        let result = scheduler.reconfigure(&SchedulerOptions {
            rate: Some(0),
            ..Default::default()
        });
        assert!(result.is_err());
        assert_eq!(scheduler.config().rate, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idempotent_reconfigure() {
        let scheduler = Scheduler::new(config(1, 1000, 10), None).unwrap();
        let mut sub = scheduler.subscribe();
        let _a = pending(&scheduler, None);
        let _b = pending(&scheduler, None);
        sub.drain();
        let before = scheduler.stats();

        scheduler.reconfigure(&SchedulerOptions::default()).unwrap();

        assert!(sub.drain().is_empty());
        assert_eq!(scheduler.stats(), before);
        assert!(scheduler.queue_state().timer_armed);
    }

    #[tokio::test]
    async fn test_set_active_pauses_new_admissions() {
        let scheduler = Scheduler::new(config(10, 1000, 10), None).unwrap();
        scheduler.set_active(false);
        let _a = pending(&scheduler, None);

        assert!(!scheduler.config().active);
        assert_eq!(scheduler.queued(), 1);
        assert_eq!(scheduler.next(), Admission::Blocked(Blocked::Paused));
    }

    #[tokio::test]
    async fn test_close_keeps_ceiling_for_in_flight() {
        let store: Arc<dyn SharedStore> = Arc::new(sharedstore::MemoryStore::new());
        let scheduler = Scheduler::new(
            SchedulerConfig {
                across_contexts: true,
                context_id: Some("closing".to_string()),
                ..config(100, 1000, 1)
            },
            Some(store.clone()),
        )
        .unwrap();

        let held = pending(&scheduler, None);
        scheduler.close();
        assert!(store.keys().unwrap().is_empty());

        let _next = pending(&scheduler, None);
        let state = scheduler.queue_state();
        assert_eq!(state.in_flight, 1);
        assert_eq!(state.queued, 1);
        assert_eq!(scheduler.current_concurrency_level(), 1);

        // Reconfiguring after close stays local
        scheduler.set_active(true);
        scheduler
            .reconfigure(&SchedulerOptions {
                context_id: Some("reopened".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert!(store.keys().unwrap().is_empty());
        assert_eq!(scheduler.queued(), 1);

        held.send(Ok(0)).unwrap();
        settle().await;
        let state = scheduler.queue_state();
        assert_eq!(state.in_flight, 1);
        assert_eq!(state.queued, 0);
    }

    #[tokio::test]
    async fn test_unknown_completion_is_ignored() {
        let scheduler = Scheduler::new(config(10, 1000, 10), None).unwrap();
        scheduler.complete(42, None);
        assert_eq!(scheduler.stats().total_completed, 0);
    }
}
