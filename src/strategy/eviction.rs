//! Eviction cache strategy: byte-bounded LRU with optional per-entry TTL.
//!
//! ## Architecture
//!
//! ```text
//!  ┌───────────────────────────────────────────────────────────────────┐
//!  │ EvictionStrategy                                                  │
//!  │                                                                   │
//!  │   backing store ──────── completed rows, ctx = Permanent(bool)    │
//!  │   read history ────────── key -> monotonic counter (non-permanent │
//!  │                           reads only; higher = more recent)       │
//!  │   deadline index ──────── (expires_at, seq) -> key, head sweep    │
//!  │                                                                   │
//!  │   used_bytes = store bytes + history bytes                        │
//!  └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Admission checks the byte ceiling (`max_threshold`) and, when crossed,
//! garbage-collects synchronously before the new entry lands. GC ranks the
//! read history by counter ascending (least recently read first) and
//! deletes entries until usage drops to the floor (`min_threshold`),
//! giving hysteresis: a sweep buys headroom for many admissions.
//!
//! Permanent entries never enter the read history, so GC never ranks them
//! and they survive every sweep; explicit invalidation still removes them.
//!
//! Reads first sweep the deadline index head for expired entries. The
//! sweep tolerates rows already removed by a concurrent invalidation: a
//! popped index entry whose row is gone counts as already satisfied.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::coordinator::CallOptions;
use crate::ds::DeadlineIndex;
use crate::error::InvariantError;
use crate::key::Key;
use crate::store::traits::EntryStore;
use crate::strategy::{CacheStrategy, EntryContext, ReadOutcome};

/// Per-key record of the most recent non-permanent read.
#[derive(Debug, Default)]
struct ReadHistory {
    map: FxHashMap<Key, u64>,
    /// Estimated byte footprint of the map, maintained incrementally.
    bytes: usize,
}

impl ReadHistory {
    fn entry_cost(key: &Key) -> usize {
        key.weight() + std::mem::size_of::<u64>()
    }

    fn record(&mut self, key: &Key, counter: u64) {
        if self.map.insert(key.clone(), counter).is_none() {
            self.bytes += Self::entry_cost(key);
        }
    }

    fn remove(&mut self, key: &Key) {
        if self.map.remove(key).is_some() {
            self.bytes = self.bytes.saturating_sub(Self::entry_cost(key));
        }
    }

    fn clear(&mut self) {
        self.map.clear();
        self.bytes = 0;
    }
}

/// LRU strategy over one backing store.
pub struct EvictionStrategy<V> {
    store: Arc<dyn EntryStore<V>>,
    max_threshold: Option<usize>,
    min_threshold: usize,
    history: Mutex<ReadHistory>,
    deadlines: Mutex<DeadlineIndex>,
    clock: AtomicU64,
}

impl<V> EvictionStrategy<V>
where
    V: Send + Sync,
{
    /// Creates the strategy over `store` with the given byte thresholds.
    ///
    /// `max_threshold = None` disables threshold GC entirely.
    pub fn new(
        store: Arc<dyn EntryStore<V>>,
        max_threshold: Option<usize>,
        min_threshold: usize,
    ) -> Self {
        Self {
            store,
            max_threshold,
            min_threshold,
            history: Mutex::new(ReadHistory::default()),
            deadlines: Mutex::new(DeadlineIndex::new()),
            clock: AtomicU64::new(0),
        }
    }

    /// Estimated byte footprint of the backing store plus read history.
    ///
    /// A racy estimate: concurrent admissions may briefly overshoot the
    /// ceiling before a sweep catches up.
    pub fn used_bytes(&self) -> usize {
        self.store.used_bytes() + self.history.lock().bytes
    }

    /// Number of keys currently ranked in the read history.
    pub fn history_len(&self) -> usize {
        self.history.lock().map.len()
    }

    /// Deletes the completed row for `key`, leaving running rows alone.
    fn delete_completed(&self, key: &Key) -> usize {
        match self.store.lookup(key) {
            Some(row) if row.state.is_completed() => {
                usize::from(self.store.delete_if_equal(key, row.version))
            },
            _ => 0,
        }
    }

    /// Sweeps expired deadlines from the index head.
    ///
    /// Returns `true` if `read_key` itself was among the evicted, in which
    /// case the caller's read must retry.
    fn clear_expired(&self, read_key: &Key) -> bool {
        let now = Instant::now();
        let mut evicted_read = false;
        let mut deadlines = self.deadlines.lock();
        while let Some(key) = deadlines.pop_expired(now) {
            // A row already invalidated concurrently reads as absent here;
            // the index entry was satisfied either way.
            self.delete_completed(&key);
            self.history.lock().remove(&key);
            if key == *read_key {
                evicted_read = true;
            }
        }
        evicted_read
    }

    /// Verifies bookkeeping invariants. Debug/test use only.
    pub fn check_invariants(&self) -> Result<(), InvariantError> {
        let history = self.history.lock();
        let recomputed: usize = history.map.keys().map(ReadHistory::entry_cost).sum();
        if recomputed != history.bytes {
            return Err(InvariantError::new("read-history byte total drifted"));
        }
        drop(history);
        self.deadlines.lock().check_invariants()
    }
}

impl<V> CacheStrategy<V> for EvictionStrategy<V>
where
    V: Send + Sync,
{
    fn store(&self) -> &Arc<dyn EntryStore<V>> {
        &self.store
    }

    fn on_cache(&self, key: &Key, _value: &Arc<V>, opts: &CallOptions) -> EntryContext {
        if let Some(max) = self.max_threshold {
            if self.used_bytes() > max {
                self.garbage_collect();
            }
        }
        if let Some(ttl) = opts.expires_in {
            self.deadlines.lock().insert(Instant::now() + ttl, key.clone());
        }
        EntryContext::Permanent(opts.permanent)
    }

    fn on_read(&self, key: &Key, _value: &Arc<V>, ctx: &EntryContext) -> ReadOutcome {
        if self.clear_expired(key) {
            return ReadOutcome::Retry;
        }
        let permanent = matches!(ctx, EntryContext::Permanent(true));
        if !permanent {
            let counter = self.clock.fetch_add(1, Ordering::Relaxed);
            self.history.lock().record(key, counter);
        }
        ReadOutcome::Ok
    }

    fn invalidate_all(&self) -> usize {
        let removed = self
            .store
            .select_delete(&mut |_, state| state.is_completed());
        self.history.lock().clear();
        debug!(removed, "invalidated all completed entries");
        removed
    }

    fn invalidate(&self, key: &Key) -> usize {
        let removed = self.delete_completed(key);
        self.history.lock().remove(key);
        removed
    }

    fn garbage_collect(&self) -> usize {
        if self.max_threshold.is_none() {
            return 0;
        }
        if self.used_bytes() <= self.min_threshold {
            return 0;
        }

        let mut ranked: Vec<(Key, u64)> = {
            let history = self.history.lock();
            history
                .map
                .iter()
                .map(|(key, &counter)| (key.clone(), counter))
                .collect()
        };
        ranked.sort_by_key(|&(_, counter)| counter);

        let mut removed = 0;
        for (key, _) in ranked {
            removed += self.delete_completed(&key);
            self.history.lock().remove(&key);
            if self.used_bytes() <= self.min_threshold {
                break;
            }
        }
        debug!(
            removed,
            used_bytes = self.used_bytes(),
            "threshold gc finished"
        );
        removed
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::store::TableStore;
    use crate::store::traits::EntryState;

    use super::*;

    /// Values weigh a flat 1000 bytes so thresholds dwarf key overhead.
    fn strategy(
        max_threshold: Option<usize>,
        min_threshold: usize,
    ) -> EvictionStrategy<String> {
        let store: Arc<dyn EntryStore<String>> =
            Arc::new(TableStore::new(2, Arc::new(|_: &String| 1000)));
        EvictionStrategy::new(store, max_threshold, min_threshold)
    }

    fn cache_entry(strategy: &EvictionStrategy<String>, key: &str, opts: &CallOptions) {
        let value = Arc::new("v".to_owned());
        let ctx = strategy.on_cache(&Key::from(key), &value, opts);
        strategy
            .store()
            .insert_if_absent(Key::from(key), EntryState::Completed { value, ctx });
    }

    fn read(strategy: &EvictionStrategy<String>, key: &str) -> ReadOutcome {
        let row = strategy.store().lookup(&Key::from(key)).unwrap();
        let EntryState::Completed { value, ctx } = row.state else {
            panic!("expected completed row for {key}");
        };
        strategy.on_read(&Key::from(key), &value, &ctx)
    }

    #[test]
    fn gc_evicts_least_recently_read_first() {
        let strategy = strategy(Some(4000), 3500);
        for i in 0..5 {
            cache_entry(&strategy, &format!("k{i}"), &CallOptions::new());
        }
        // Establish recency order k0 (oldest) .. k4 (newest).
        for i in 0..5 {
            assert_eq!(read(&strategy, &format!("k{i}")), ReadOutcome::Ok);
        }

        let removed = strategy.garbage_collect();
        assert_eq!(removed, 2, "usage should drop below the floor after two");
        assert!(strategy.store().lookup(&Key::from("k0")).is_none());
        assert!(strategy.store().lookup(&Key::from("k1")).is_none());
        for i in 2..5 {
            assert!(
                strategy.store().lookup(&Key::from(format!("k{i}"))).is_some(),
                "k{i} was read more recently and should survive"
            );
        }
        strategy.check_invariants().unwrap();
    }

    #[test]
    fn gc_is_a_noop_without_a_ceiling() {
        let strategy = strategy(None, 0);
        cache_entry(&strategy, "k", &CallOptions::new());
        read(&strategy, "k");
        assert_eq!(strategy.garbage_collect(), 0);
        assert!(strategy.store().lookup(&Key::from("k")).is_some());
    }

    #[test]
    fn gc_is_a_noop_below_the_floor() {
        let strategy = strategy(Some(1_000_000), 1_000_000);
        cache_entry(&strategy, "k", &CallOptions::new());
        read(&strategy, "k");
        assert_eq!(strategy.garbage_collect(), 0);
    }

    #[test]
    fn permanent_entries_survive_gc() {
        let strategy = strategy(Some(1), 0);
        cache_entry(&strategy, "pinned", &CallOptions::new().permanent(true));
        cache_entry(&strategy, "plain", &CallOptions::new());
        assert_eq!(read(&strategy, "pinned"), ReadOutcome::Ok);
        assert_eq!(read(&strategy, "plain"), ReadOutcome::Ok);

        strategy.garbage_collect();
        assert!(strategy.store().lookup(&Key::from("pinned")).is_some());
        assert!(strategy.store().lookup(&Key::from("plain")).is_none());
    }

    #[test]
    fn permanent_reads_stay_out_of_the_history() {
        let strategy = strategy(Some(1_000_000), 0);
        cache_entry(&strategy, "pinned", &CallOptions::new().permanent(true));
        assert_eq!(read(&strategy, "pinned"), ReadOutcome::Ok);
        assert_eq!(strategy.history_len(), 0);
    }

    #[test]
    fn repeated_reads_replace_the_counter() {
        let strategy = strategy(Some(1_000_000), 0);
        cache_entry(&strategy, "k", &CallOptions::new());
        let baseline = {
            read(&strategy, "k");
            strategy.used_bytes()
        };
        for _ in 0..10 {
            read(&strategy, "k");
        }
        assert_eq!(strategy.history_len(), 1);
        assert_eq!(strategy.used_bytes(), baseline);
        strategy.check_invariants().unwrap();
    }

    #[test]
    fn expired_entry_is_swept_on_read() {
        let strategy = strategy(None, 0);
        cache_entry(
            &strategy,
            "fleeting",
            &CallOptions::new().expires_in(Duration::from_millis(1)),
        );
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(read(&strategy, "fleeting"), ReadOutcome::Retry);
        assert!(strategy.store().lookup(&Key::from("fleeting")).is_none());
    }

    #[test]
    fn expiry_sweep_evicts_other_stale_heads() {
        let strategy = strategy(None, 0);
        cache_entry(
            &strategy,
            "stale",
            &CallOptions::new().expires_in(Duration::from_millis(1)),
        );
        cache_entry(&strategy, "live", &CallOptions::new());
        std::thread::sleep(Duration::from_millis(5));

        // Reading the live key sweeps the stale one but keeps the read.
        assert_eq!(read(&strategy, "live"), ReadOutcome::Ok);
        assert!(strategy.store().lookup(&Key::from("stale")).is_none());
        assert!(strategy.store().lookup(&Key::from("live")).is_some());
    }

    #[test]
    fn sweep_tolerates_already_invalidated_rows() {
        let strategy = strategy(None, 0);
        cache_entry(
            &strategy,
            "gone",
            &CallOptions::new().expires_in(Duration::from_millis(1)),
        );
        assert_eq!(strategy.invalidate(&Key::from("gone")), 1);
        std::thread::sleep(Duration::from_millis(5));

        cache_entry(&strategy, "live", &CallOptions::new());
        assert_eq!(read(&strategy, "live"), ReadOutcome::Ok);
    }

    #[test]
    fn invalidate_clears_the_history_entry() {
        let strategy = strategy(Some(1_000_000), 0);
        cache_entry(&strategy, "k", &CallOptions::new());
        read(&strategy, "k");
        assert_eq!(strategy.history_len(), 1);

        assert_eq!(strategy.invalidate(&Key::from("k")), 1);
        assert_eq!(strategy.history_len(), 0);
        assert_eq!(strategy.invalidate(&Key::from("k")), 0);
        strategy.check_invariants().unwrap();
    }

    #[test]
    fn invalidate_all_resets_history() {
        let strategy = strategy(Some(1_000_000), 0);
        for i in 0..4 {
            cache_entry(&strategy, &format!("k{i}"), &CallOptions::new());
            read(&strategy, &format!("k{i}"));
        }
        assert_eq!(strategy.invalidate_all(), 4);
        assert_eq!(strategy.history_len(), 0);
        assert_eq!(strategy.store().len(), 0);
    }
}
