//! In-flight accounting, optionally aggregated across contexts
//!
//! Each context owns one entry `<prefix>.<context_id>` in the shared store and
//! only ever writes that entry. Reading the aggregate sums every entry under the
//! prefix, skipping entries of other contexts that have been idle for longer
//! than the expiry (their owner presumably went away without cleaning up).
//!
//! Several schedulers of one process may share a key (by default they all use
//! the process context id). A process-wide registry counts the users of each
//! key on each store handle so that only the last one to leave removes the
//! entry; schedulers sharing a context should be handed the same `Arc`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sharedstore::SharedStore;
use tracing::{debug, info, warn};

use super::config::SchedulerConfig;

static PROCESS_CONTEXT_ID: OnceLock<String> = OnceLock::new();

/// Live counters per (store, key) within this process
static KEY_USERS: OnceLock<Mutex<HashMap<(usize, String), usize>>> = OnceLock::new();

fn key_users() -> MutexGuard<'static, HashMap<(usize, String), usize>> {
    KEY_USERS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

fn store_id(store: &Arc<dyn SharedStore>) -> usize {
    Arc::as_ptr(store).cast::<()>() as usize
}

/// Identity of the current process as an execution context
///
/// The epoch-ms at which the first scheduler of this process asked for it.
pub fn process_context_id() -> &'static str {
    PROCESS_CONTEXT_ID.get_or_init(|| epoch_ms().to_string())
}

fn epoch_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// One context's accounting record, as stored in the shared store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextEntry {
    pub current_count: u64,
    pub last_action_at: i64,
}

impl ContextEntry {
    /// Entry stamped with the current time
    pub fn now(current_count: u64) -> Self {
        Self {
            current_count,
            last_action_at: epoch_ms(),
        }
    }

    /// Parse a stored value; malformed values yield `None`
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }

    /// Whether the entry has been idle for longer than `expire` at `now_ms`
    pub fn is_stale(&self, now_ms: i64, expire: Duration) -> bool {
        now_ms.saturating_sub(self.last_action_at) > expire.as_millis() as i64
    }

    fn to_json(self) -> String {
        // Two integer fields cannot fail to serialize
        serde_json::to_string(&self).unwrap_or_default()
    }
}

/// List every key under `prefix` with its parsed entry (`None` when malformed)
pub fn read_entries(store: &dyn SharedStore, prefix: &str) -> Vec<(String, Option<ContextEntry>)> {
    let namespace = format!("{prefix}.");
    let keys = match store.keys() {
        Ok(keys) => keys,
        Err(e) => {
            warn!(error = %e, "read_entries: failed to enumerate shared store");
            return Vec::new();
        }
    };

    keys.into_iter()
        .filter(|key| key.starts_with(&namespace))
        .filter_map(|key| match store.get(&key) {
            Ok(Some(raw)) => {
                let entry = ContextEntry::parse(&raw);
                if entry.is_none() {
                    debug!(%key, "read_entries: skipping malformed entry");
                }
                Some((key, entry))
            }
            // Removed between enumerate and read
            Ok(None) => None,
            Err(e) => {
                warn!(%key, error = %e, "read_entries: failed to read entry");
                None
            }
        })
        .collect()
}

/// In-flight counter for one scheduler
pub struct ConcurrencyCounter {
    local: u64,
    store: Option<Arc<dyn SharedStore>>,
    shared: bool,
    prefix: String,
    own_key: String,
    expire: Duration,
    /// Holds a slot in the key registry
    registered: bool,
    /// Left cross-context mode for good
    detached: bool,
}

impl ConcurrencyCounter {
    /// Build a counter; cross-context mode needs a store
    pub fn new(config: &SchedulerConfig, store: Option<Arc<dyn SharedStore>>) -> Self {
        let shared = config.across_contexts && store.is_some();
        Self {
            local: 0,
            store,
            shared,
            prefix: config.context_id_prefix.clone(),
            own_key: own_key(config),
            expire: config.context_expire(),
            registered: false,
            detached: false,
        }
    }

    /// Whether counts are aggregated through the shared store
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    /// Key of this context's entry
    pub fn own_key(&self) -> &str {
        &self.own_key
    }

    /// In-flight operations started by this scheduler
    pub fn own_count(&self) -> u64 {
        self.local
    }

    /// Register as a user of the own key and create its entry if needed
    ///
    /// Another scheduler of the same context may already have created the
    /// entry; its count is kept and this counter's in-flight count added.
    pub fn init(&mut self, sweep: bool) {
        let Some(store) = self.shared_store().cloned() else {
            return;
        };

        if !self.registered {
            *key_users().entry((store_id(&store), self.own_key.clone())).or_insert(0) += 1;
            self.registered = true;
        }

        match store.get(&self.own_key) {
            Ok(Some(raw)) => {
                debug!(key = %self.own_key, "ConcurrencyCounter::init: own entry already present");
                if self.local > 0 {
                    let count = ContextEntry::parse(&raw).map_or(0, |e| e.current_count);
                    self.write_own(store.as_ref(), count + self.local);
                }
            }
            Ok(None) => {
                info!(key = %self.own_key, "Registering context in shared store");
                self.write_own(store.as_ref(), self.local);
            }
            Err(e) => {
                warn!(key = %self.own_key, error = %e, "Failed to read own context entry");
            }
        }

        if sweep {
            self.sweep_stale();
        }
    }

    /// Remove entries of other contexts that have gone stale
    ///
    /// Returns the number of entries removed.
    pub fn sweep_stale(&self) -> usize {
        let Some(store) = self.shared_store() else {
            return 0;
        };

        let now = epoch_ms();
        let mut removed = 0;
        for (key, entry) in read_entries(store.as_ref(), &self.prefix) {
            if key == self.own_key {
                continue;
            }
            if let Some(entry) = entry {
                if entry.is_stale(now, self.expire) {
                    match store.remove(&key) {
                        Ok(()) => removed += 1,
                        Err(e) => warn!(%key, error = %e, "Failed to sweep stale context entry"),
                    }
                }
            }
        }

        if removed > 0 {
            info!(removed, "Swept stale context entries");
        }
        removed
    }

    /// Current concurrency: own count, or the live aggregate across contexts
    ///
    /// If the own entry has disappeared from the store, this counter's own
    /// in-flight operations are still counted.
    pub fn current(&self) -> u64 {
        let Some(store) = self.shared_store() else {
            return self.local;
        };

        let now = epoch_ms();
        let mut own_seen = false;
        let others: u64 = read_entries(store.as_ref(), &self.prefix)
            .into_iter()
            .filter_map(|(key, entry)| {
                let entry = entry?;
                if key == self.own_key {
                    own_seen = true;
                    Some(entry.current_count)
                } else if !entry.is_stale(now, self.expire) {
                    Some(entry.current_count)
                } else {
                    debug!(%key, "ConcurrencyCounter::current: ignoring stale context");
                    None
                }
            })
            .sum();

        if own_seen { others } else { others + self.local }
    }

    /// Add `delta` to this context's count and return the new value
    ///
    /// In cross-context mode a missing own entry means the context is being
    /// torn down; the adjustment is then a no-op returning 0.
    pub fn adjust(&mut self, delta: i64) -> u64 {
        self.local = self.local.saturating_add_signed(delta);

        let Some(store) = self.shared_store() else {
            return self.local;
        };

        let entry = match store.get(&self.own_key) {
            Ok(Some(raw)) => ContextEntry::parse(&raw),
            Ok(None) => None,
            Err(e) => {
                warn!(key = %self.own_key, error = %e, "Failed to read own context entry");
                None
            }
        };
        let Some(entry) = entry else {
            debug!(key = %self.own_key, delta, "ConcurrencyCounter::adjust: own entry missing, skipping");
            return 0;
        };

        let updated = ContextEntry::now(entry.current_count.saturating_add_signed(delta));
        if let Err(e) = store.set(&self.own_key, &updated.to_json()) {
            warn!(key = %self.own_key, error = %e, "Failed to write own context entry");
        }
        updated.current_count
    }

    /// Follow a configuration change
    ///
    /// Leaving cross-context mode or moving to a different key removes the old
    /// entry; entering it (or arriving at a new key) registers the new one.
    ///
    /// A detached counter stays local whatever the configuration says.
    pub fn reconfigure(&mut self, config: &SchedulerConfig) {
        let shared = config.across_contexts && self.store.is_some() && !self.detached;
        let key = own_key(config);
        let moved = shared != self.shared || key != self.own_key || config.context_id_prefix != self.prefix;

        if moved {
            self.release();
        }
        self.shared = shared;
        self.prefix = config.context_id_prefix.clone();
        self.own_key = key;
        self.expire = config.context_expire();
        if moved {
            self.init(false);
        }
    }

    /// Give up this counter's share of the own entry (best-effort)
    ///
    /// The last user of the key removes the entry. Earlier ones only subtract
    /// their in-flight count so the remaining users keep accurate totals.
    pub fn release(&mut self) {
        if !self.registered {
            return;
        }
        self.registered = false;
        let Some(store) = self.shared_store().cloned() else {
            return;
        };

        let last = {
            let mut users = key_users();
            let slot = (store_id(&store), self.own_key.clone());
            let remaining = users.get(&slot).map_or(0, |n| n.saturating_sub(1));
            if remaining == 0 {
                users.remove(&slot);
            } else {
                users.insert(slot, remaining);
            }
            remaining == 0
        };

        if last {
            info!(key = %self.own_key, "Removing context from shared store");
            if let Err(e) = store.remove(&self.own_key) {
                warn!(key = %self.own_key, error = %e, "Failed to remove context entry");
            }
        } else if self.local > 0 {
            debug!(key = %self.own_key, local = self.local, "ConcurrencyCounter::release: key still in use");
            match store.get(&self.own_key) {
                Ok(Some(raw)) => {
                    let count = ContextEntry::parse(&raw).map_or(0, |e| e.current_count);
                    self.write_own(store.as_ref(), count.saturating_sub(self.local));
                }
                Ok(None) => {}
                Err(e) => warn!(key = %self.own_key, error = %e, "Failed to read own context entry"),
            }
        }
    }

    /// Release the own entry and fall back to local accounting for good
    ///
    /// Operations still in flight keep counting against this counter.
    pub fn detach(&mut self) {
        self.release();
        self.shared = false;
        self.detached = true;
    }

    fn write_own(&self, store: &dyn SharedStore, count: u64) {
        if let Err(e) = store.set(&self.own_key, &ContextEntry::now(count).to_json()) {
            warn!(key = %self.own_key, error = %e, "Failed to write own context entry");
        }
    }

    fn shared_store(&self) -> Option<&Arc<dyn SharedStore>> {
        if self.shared { self.store.as_ref() } else { None }
    }
}

impl Drop for ConcurrencyCounter {
    fn drop(&mut self) {
        self.release();
    }
}

fn own_key(config: &SchedulerConfig) -> String {
    let id = config.context_id.as_deref().unwrap_or_else(|| process_context_id());
    format!("{}.{}", config.context_id_prefix, id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sharedstore::MemoryStore;

    fn shared_config(id: &str) -> SchedulerConfig {
        SchedulerConfig {
            across_contexts: true,
            context_id: Some(id.to_string()),
            context_expire_ms: 10_000,
            ..Default::default()
        }
    }

    fn counter(store: &MemoryStore, id: &str) -> ConcurrencyCounter {
        counter_on(Arc::new(store.clone()), id)
    }

    fn counter_on(store: Arc<dyn SharedStore>, id: &str) -> ConcurrencyCounter {
        let mut counter = ConcurrencyCounter::new(&shared_config(id), Some(store));
        counter.init(false);
        counter
    }

    fn stored_count(store: &MemoryStore, key: &str) -> Option<u64> {
        let raw = store.get(key).unwrap()?;
        ContextEntry::parse(&raw).map(|e| e.current_count)
    }

    #[test]
    fn test_entry_wire_format() {
        let entry = ContextEntry {
            current_count: 3,
            last_action_at: 1_718_000_000_000,
        };
        assert_eq!(entry.to_json(), r#"{"currentCount":3,"lastActionAt":1718000000000}"#);
        assert_eq!(ContextEntry::parse(&entry.to_json()), Some(entry));
        assert_eq!(ContextEntry::parse("{not json"), None);
    }

    #[test]
    fn test_is_stale() {
        let entry = ContextEntry {
            current_count: 1,
            last_action_at: 1_000,
        };
        let expire = Duration::from_millis(500);
        assert!(!entry.is_stale(1_500, expire));
        assert!(entry.is_stale(1_501, expire));
    }

    #[test]
    fn test_local_mode_ignores_store() {
        let store = MemoryStore::new();
        let config = SchedulerConfig::default();
        let mut counter = ConcurrencyCounter::new(&config, Some(Arc::new(store.clone())));
        counter.init(false);

        assert!(!counter.is_shared());
        assert_eq!(counter.adjust(1), 1);
        assert_eq!(counter.adjust(1), 2);
        assert_eq!(counter.adjust(-1), 1);
        assert_eq!(counter.current(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_shared_mode_without_store_falls_back() {
        let mut counter = ConcurrencyCounter::new(&shared_config("solo"), None);
        assert!(!counter.is_shared());
        assert_eq!(counter.adjust(1), 1);
    }

    #[test]
    fn test_init_creates_entry_once() {
        let store = MemoryStore::new();
        let mut first = counter(&store, "ctx");
        assert_eq!(first.adjust(1), 1);

        // A second scheduler in the same context must not reset the count
        let second = counter(&store, "ctx");
        assert_eq!(second.current(), 1);
        let raw = store.get("admitgate.ctx").unwrap().unwrap();
        assert_eq!(ContextEntry::parse(&raw).unwrap().current_count, 1);
    }

    #[test]
    fn test_aggregate_across_contexts() {
        let store = MemoryStore::new();
        let mut a = counter(&store, "a");
        let mut b = counter(&store, "b");

        a.adjust(1);
        a.adjust(1);
        b.adjust(1);

        assert_eq!(a.current(), 3);
        assert_eq!(b.current(), 3);
        assert_eq!(a.own_count(), 2);
    }

    #[test]
    fn test_stale_entries_excluded() {
        let store = MemoryStore::new();
        let mut a = counter(&store, "a");
        a.adjust(1);

        let dead = ContextEntry {
            current_count: 5,
            last_action_at: epoch_ms() - 60_000,
        };
        store.set("admitgate.dead", &dead.to_json()).unwrap();

        assert_eq!(a.current(), 1);
    }

    #[test]
    fn test_own_entry_counts_even_when_stale() {
        let store = MemoryStore::new();
        let a = counter(&store, "a");
        let old = ContextEntry {
            current_count: 2,
            last_action_at: epoch_ms() - 60_000,
        };
        store.set(a.own_key(), &old.to_json()).unwrap();

        assert_eq!(a.current(), 2);
    }

    #[test]
    fn test_malformed_and_foreign_entries_skipped() {
        let store = MemoryStore::new();
        let mut a = counter(&store, "a");
        a.adjust(1);

        store.set("admitgate.broken", "garbage").unwrap();
        store.set("otherapp.1", r#"{"currentCount":9,"lastActionAt":0}"#).unwrap();
        store
            .set("admitgatex.1", &ContextEntry::now(4).to_json())
            .unwrap();

        assert_eq!(a.current(), 1);
    }

    #[test]
    fn test_adjust_without_own_entry_is_noop() {
        let store = MemoryStore::new();
        let mut a = counter(&store, "a");
        store.remove(a.own_key()).unwrap();

        assert_eq!(a.adjust(1), 0);
        assert!(store.get(a.own_key()).unwrap().is_none());
    }

    #[test]
    fn test_sweep_removes_only_stale_others() {
        let store = MemoryStore::new();
        let a = counter(&store, "a");

        let dead = ContextEntry {
            current_count: 1,
            last_action_at: epoch_ms() - 60_000,
        };
        store.set("admitgate.dead", &dead.to_json()).unwrap();
        store.set("admitgate.live", &ContextEntry::now(1).to_json()).unwrap();

        assert_eq!(a.sweep_stale(), 1);
        assert!(store.get("admitgate.dead").unwrap().is_none());
        assert!(store.get("admitgate.live").unwrap().is_some());
        assert!(store.get(a.own_key()).unwrap().is_some());
    }

    #[test]
    fn test_teardown_and_reconfigure() {
        let store = MemoryStore::new();
        let mut a = counter(&store, "a");
        a.adjust(1);

        a.reconfigure(&SchedulerConfig {
            across_contexts: false,
            ..shared_config("a")
        });
        assert!(!a.is_shared());
        assert!(store.get("admitgate.a").unwrap().is_none());

        a.reconfigure(&shared_config("b"));
        assert!(a.is_shared());
        let raw = store.get("admitgate.b").unwrap().unwrap();
        // Carries the in-flight count over so completions balance out
        assert_eq!(ContextEntry::parse(&raw).unwrap().current_count, 1);
    }

    #[test]
    fn test_read_entries() {
        let store = MemoryStore::new();
        store.set("admitgate.1", &ContextEntry::now(2).to_json()).unwrap();
        store.set("admitgate.2", "bad").unwrap();
        store.set("elsewhere", "x").unwrap();

        let entries = read_entries(&store, "admitgate");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].1.map(|e| e.current_count), Some(2));
        assert_eq!(entries[1].1, None);
    }

    #[test]
    fn test_detach_keeps_counting_own_in_flight() {
        let store = MemoryStore::new();
        let mut a = counter(&store, "a");
        a.adjust(1);

        a.detach();
        assert!(!a.is_shared());
        assert!(store.get("admitgate.a").unwrap().is_none());
        assert_eq!(a.current(), 1);
        assert_eq!(a.adjust(-1), 0);

        // Cannot be pulled back into cross-context mode
        a.reconfigure(&shared_config("b"));
        assert!(!a.is_shared());
        assert!(store.is_empty());
    }

    #[test]
    fn test_release_by_one_user_keeps_shared_entry() {
        let store = MemoryStore::new();
        let shared: Arc<dyn SharedStore> = Arc::new(store.clone());
        let mut first = counter_on(shared.clone(), "ctx");
        let mut second = counter_on(shared.clone(), "ctx");
        first.adjust(1);
        second.adjust(1);
        second.adjust(1);
        assert_eq!(stored_count(&store, "admitgate.ctx"), Some(3));

        // Only the first counter's share leaves the entry
        first.detach();
        assert_eq!(stored_count(&store, "admitgate.ctx"), Some(2));
        assert_eq!(second.current(), 2);

        drop(second);
        assert_eq!(stored_count(&store, "admitgate.ctx"), None);
    }

    #[test]
    fn test_current_counts_own_when_entry_missing() {
        let store = MemoryStore::new();
        let mut a = counter(&store, "a");
        a.adjust(1);
        store.set("admitgate.b", &ContextEntry::now(1).to_json()).unwrap();
        store.remove(a.own_key()).unwrap();

        assert_eq!(a.current(), 2);
    }
}
