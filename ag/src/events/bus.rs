//! Event Bus - pub/sub for scheduler events
//!
//! The EventBus uses a tokio broadcast channel to deliver events to all
//! subscribers. Each subscription names the event kinds it cares about, and the
//! bus keeps a per-kind listener count so the scheduler can tell whether anyone
//! is listening for a given kind before emitting it.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, warn};

use super::types::{EventKind, KIND_COUNT, SchedulerEvent};

/// Default channel capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1_024;

type ListenerCounts = [AtomicUsize; KIND_COUNT];

/// Central event bus for scheduler activity
pub struct EventBus {
    tx: broadcast::Sender<SchedulerEvent>,
    listeners: Arc<ListenerCounts>,
    channel_capacity: usize,
}

impl EventBus {
    /// Create a new event bus with the given capacity
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "EventBus::new: creating event bus");
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            listeners: Arc::new(Default::default()),
            channel_capacity: capacity,
        }
    }

    /// Create a new event bus with default capacity
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Channel capacity this bus was created with
    pub fn capacity(&self) -> usize {
        self.channel_capacity
    }

    /// Emit an event to all subscribers
    ///
    /// This is fire-and-forget: if there are no subscribers, the event is dropped.
    /// If a subscriber falls behind by more than the capacity, it lags.
    pub fn emit(&self, event: SchedulerEvent) {
        debug!(event_type = event.event_type(), request_id = ?event.request_id(), "EventBus::emit");
        // No subscribers is OK
        let _ = self.tx.send(event);
    }

    /// Subscribe to every event kind
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_to(&EventKind::ALL)
    }

    /// Subscribe to the named event kinds only
    ///
    /// The returned [`Subscription`] is the registration handle; dropping it
    /// deregisters. Events emitted before subscription are not received.
    pub fn subscribe_to(&self, kinds: &[EventKind]) -> Subscription {
        let mut wanted = [false; KIND_COUNT];
        for kind in kinds {
            wanted[kind.index()] = true;
        }
        for kind in EventKind::ALL.iter().filter(|k| wanted[k.index()]) {
            self.listeners[kind.index()].fetch_add(1, Ordering::SeqCst);
        }
        debug!(?kinds, "EventBus::subscribe_to: new subscriber");

        Subscription {
            rx: self.tx.subscribe(),
            wanted,
            listeners: Arc::clone(&self.listeners),
            lagged: 0,
        }
    }

    /// Whether at least one live subscription wants this kind
    pub fn has_listeners(&self, kind: EventKind) -> bool {
        self.listeners[kind.index()].load(Ordering::SeqCst) > 0
    }

    /// Get the number of active subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Handle for one registered observer
///
/// Receives only the event kinds it subscribed to, in emission order.
pub struct Subscription {
    rx: broadcast::Receiver<SchedulerEvent>,
    wanted: [bool; KIND_COUNT],
    listeners: Arc<ListenerCounts>,
    lagged: u64,
}

impl Subscription {
    /// Events lost to lag while draining, over this subscription's lifetime
    pub fn lagged(&self) -> u64 {
        self.lagged
    }

    /// Whether this subscription receives the given kind
    pub fn wants(&self, kind: EventKind) -> bool {
        self.wanted[kind.index()]
    }

    /// Wait for the next wanted event
    pub async fn recv(&mut self) -> Result<SchedulerEvent, RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if self.wants(event.kind()) {
                return Ok(event);
            }
        }
    }

    /// Take the next wanted event if one is already buffered
    pub fn try_recv(&mut self) -> Result<SchedulerEvent, TryRecvError> {
        loop {
            let event = self.rx.try_recv()?;
            if self.wants(event.kind()) {
                return Ok(event);
            }
        }
    }

    /// Drain every wanted event already buffered
    pub fn drain(&mut self) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();
        loop {
            match self.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Lagged(n)) => {
                    warn!(missed = n, "Subscription::drain: subscriber lagged, events lost");
                    self.lagged += n;
                }
                Err(_) => break,
            }
        }
        events
    }

    /// Deregister this observer
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        for kind in EventKind::ALL.iter().filter(|k| self.wanted[k.index()]) {
            self.listeners[kind.index()].fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Create an event bus wrapped in an Arc for shared ownership
pub fn create_event_bus() -> Arc<EventBus> {
    Arc::new(EventBus::with_default_capacity())
}
