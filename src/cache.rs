//! Process-wide TTL cache.
//!
//! Entries carry an optional deadline. All deadlines of one cache live in a
//! single ordered index that a background task sweeps, instead of one timer
//! per key. Time is read through a [`Clock`] so expiry can be driven
//! deterministically in tests.
//!
//! Every value leaves the cache through exactly one of: natural expiry,
//! [`TtlCache::remove`], [`TtlCache::clear`] (each of which hands it to the
//! eviction callback once), or replacement by a newer value under the same
//! key (which drops it without eviction).

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

/// Source of the current time for expiry decisions.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

/// Reads the tokio clock, so paused-time tests advance it too.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    base: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|p| p.into_inner());
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap_or_else(|p| p.into_inner())
    }
}

type EvictFn<V> = dyn Fn(&str, V) -> anyhow::Result<()> + Send + Sync;

/// Position in the expiry index. The sequence number tells apart deadlines
/// of successive values stored under the same key.
type Slot = (Instant, u64);

struct Entry<V> {
    value: V,
    slot: Option<Slot>,
}

impl<V> Entry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.slot.map_or(true, |(deadline, _)| deadline > now)
    }
}

struct State<V> {
    entries: HashMap<String, Entry<V>>,
    schedule: BTreeMap<Slot, String>,
    next_seq: u64,
}

struct Inner<V> {
    name: &'static str,
    state: Mutex<State<V>>,
    on_evict: Box<EvictFn<V>>,
    clock: Arc<dyn Clock>,
    wake: Arc<Notify>,
}

impl<V> Drop for Inner<V> {
    fn drop(&mut self) {
        // lets a parked expiry task observe that the cache is gone
        self.wake.notify_one();
    }
}

/// Keyed store with per-entry expiry and an eviction callback.
///
/// Cloning is cheap and yields a handle to the same cache.
pub struct TtlCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for TtlCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> fmt::Debug for TtlCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlCache")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl<V: Clone + Send + 'static> TtlCache<V> {
    /// Create a cache reading the tokio clock.
    pub fn new<F>(name: &'static str, on_evict: F) -> Self
    where
        F: Fn(&str, V) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::with_clock(name, Arc::new(TokioClock), on_evict)
    }

    /// Create a cache reading the given clock.
    pub fn with_clock<F>(name: &'static str, clock: Arc<dyn Clock>, on_evict: F) -> Self
    where
        F: Fn(&str, V) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                name,
                state: Mutex::new(State {
                    entries: HashMap::new(),
                    schedule: BTreeMap::new(),
                    next_seq: 0,
                }),
                on_evict: Box::new(on_evict),
                clock,
                wake: Arc::new(Notify::new()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<V>> {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Store `value` under `key` for `ttl`; a zero `ttl` never expires.
    ///
    /// Replacing a key cancels its pending deadline. The replaced value is
    /// dropped, not evicted.
    pub fn add(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let mut guard = self.lock();
        let state = &mut *guard;

        // a deadline past the clock's range never fires
        let deadline = if ttl.is_zero() {
            None
        } else {
            self.inner.clock.now().checked_add(ttl)
        };
        let slot = deadline.map(|deadline| {
            let seq = state.next_seq;
            state.next_seq += 1;
            (deadline, seq)
        });

        let superseded = state.entries.insert(key.clone(), Entry { value, slot });
        if let Some(old_slot) = superseded.as_ref().and_then(|entry| entry.slot) {
            state.schedule.remove(&old_slot);
        }

        let mut earliest = false;
        if let Some(slot) = slot {
            state.schedule.insert(slot, key.clone());
            earliest = state
                .schedule
                .first_key_value()
                .is_some_and(|(first, _)| *first == slot);
        }
        drop(guard);
        drop(superseded);

        trace!(cache = self.inner.name, key = %key, ttl_ms = ttl.as_millis() as u64, "cache add");
        if earliest {
            self.inner.wake.notify_one();
        }
    }

    /// The live value under `key`, if any.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.inner.clock.now();
        self.lock()
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    /// The live value under `key`, or `default`.
    pub fn get_or(&self, key: &str, default: V) -> V {
        self.get(key).unwrap_or(default)
    }

    /// Snapshot of all live entries.
    pub fn to_map(&self) -> HashMap<String, V> {
        let now = self.inner.clock.now();
        self.lock()
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict one entry. Returns whether it existed.
    pub fn remove(&self, key: &str) -> bool {
        let removed = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let removed = state.entries.remove(key);
            if let Some(slot) = removed.as_ref().and_then(|entry| entry.slot) {
                state.schedule.remove(&slot);
            }
            removed
        };
        match removed {
            Some(entry) => {
                self.evict(key, entry.value);
                true
            }
            None => false,
        }
    }

    /// Evict every entry, invoking the eviction callback once per entry.
    pub fn clear(&self) -> usize {
        let drained: Vec<(String, Entry<V>)> = {
            let mut state = self.lock();
            state.schedule.clear();
            state.entries.drain().collect()
        };
        let count = drained.len();
        for (key, entry) in drained {
            self.evict(&key, entry.value);
        }
        debug!(cache = self.inner.name, evicted = count, "cache cleared");
        count
    }

    /// Evict every entry whose deadline has passed. Returns how many.
    pub fn expire_due(&self) -> usize {
        let now = self.inner.clock.now();
        let mut expired = Vec::new();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            while state
                .schedule
                .first_key_value()
                .is_some_and(|((deadline, _), _)| *deadline <= now)
            {
                let Some((slot, key)) = state.schedule.pop_first() else {
                    break;
                };
                // the entry may have been replaced since this deadline was set
                let owns_slot = state
                    .entries
                    .get(&key)
                    .is_some_and(|entry| entry.slot == Some(slot));
                if owns_slot {
                    if let Some(entry) = state.entries.remove(&key) {
                        expired.push((key, entry.value));
                    }
                }
            }
        }
        let count = expired.len();
        for (key, value) in expired {
            debug!(cache = self.inner.name, key = %key, "cache entry expired");
            self.evict(&key, value);
        }
        count
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.lock()
            .schedule
            .first_key_value()
            .map(|((deadline, _), _)| *deadline)
    }

    /// Start the task that sweeps expired entries.
    ///
    /// The task parks until the earliest deadline or until an `add` brings
    /// in an earlier one, and exits once every handle to the cache is gone.
    pub fn spawn_expiry_task(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let wake = Arc::clone(&self.inner.wake);
        let name = self.inner.name;
        tokio::spawn(async move {
            loop {
                let wait = {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    let cache = TtlCache { inner };
                    cache.expire_due();
                    cache
                        .next_deadline()
                        .map(|deadline| deadline.saturating_duration_since(cache.inner.clock.now()))
                };
                match wait {
                    Some(wait) => {
                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {}
                            _ = wake.notified() => {}
                        }
                    }
                    None => wake.notified().await,
                }
            }
            debug!(cache = name, "expiry task stopped");
        })
    }

    fn evict(&self, key: &str, value: V) {
        if let Err(err) = (self.inner.on_evict)(key, value) {
            error!(
                cache = self.inner.name,
                key = %key,
                error = %format!("{err:#}"),
                "eviction callback failed, aborting"
            );
            std::process::exit(1);
        }
    }
}
