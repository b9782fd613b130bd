//! Sharded in-memory entry table: the primary backing-store variant.
//!
//! ## Architecture
//!
//! - Rows are spread over independent `RwLock`-guarded shards picked by a
//!   seeded hash, so callers racing on different keys rarely share a lock.
//! - Each row carries a version stamp refreshed on every write; CAS
//!   operations compare the stamp the caller observed at lookup time.
//! - Byte usage is maintained incrementally: every row stores its
//!   precomputed weight (key footprint + weighed value), and a shared
//!   counter moves on insert, replace and delete.
//!
//! ## Core Operations
//!
//! - `insert_if_absent`: create a row, losing to any concurrent creator.
//! - `replace_if_equal` / `delete_if_equal`: version-checked CAS.
//! - `lookup`: clone the row out so no lock is held across caller code.
//! - `select_delete`: predicate sweep for invalidation and GC.
//!
//! ## Thread Safety
//!
//! `TableStore` is `Send + Sync`; all methods take `&self`. Lock scope is
//! one shard per call, and no user code (weighers aside) runs under a
//! shard lock.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::ds::ShardSelector;
use crate::key::Key;
use crate::store::traits::{
    EntryState, EntryStore, StoreCounters, StoreMetrics, VersionedEntry, Weigher, entry_weight,
};

/// One stored row: versioned state plus its precomputed weight.
#[derive(Debug)]
struct Slot<V> {
    version: u64,
    state: EntryState<V>,
    weight: usize,
}

/// Sharded concurrent entry table.
pub struct TableStore<V> {
    shards: Vec<RwLock<FxHashMap<Key, Slot<V>>>>,
    selector: ShardSelector,
    size: AtomicUsize,
    bytes: AtomicUsize,
    version: AtomicU64,
    weigher: Weigher<V>,
    counters: StoreCounters,
}

impl<V> std::fmt::Debug for TableStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableStore")
            .field("shards", &self.shards.len())
            .field("len", &self.size.load(Ordering::Relaxed))
            .field("used_bytes", &self.bytes.load(Ordering::Relaxed))
            .finish()
    }
}

impl<V> TableStore<V>
where
    V: Send + Sync,
{
    /// Creates a table with at least `shards` lock shards and the given
    /// weigher.
    ///
    /// The shard count is rounded up to a power of two by the stripe
    /// selector.
    pub fn new(shards: usize, weigher: Weigher<V>) -> Self {
        let selector = ShardSelector::new(shards, 0);
        let mut shard_vec = Vec::with_capacity(selector.shard_count());
        for _ in 0..selector.shard_count() {
            shard_vec.push(RwLock::new(FxHashMap::default()));
        }
        Self {
            shards: shard_vec,
            selector,
            size: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
            version: AtomicU64::new(0),
            weigher,
            counters: StoreCounters::default(),
        }
    }

    /// Returns the number of lock shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn shard_for(&self, key: &Key) -> &RwLock<FxHashMap<Key, Slot<V>>> {
        &self.shards[self.selector.shard_for_key(key)]
    }
}

impl<V> EntryStore<V> for TableStore<V>
where
    V: Send + Sync,
{
    fn insert_if_absent(&self, key: Key, state: EntryState<V>) -> bool {
        let weight = entry_weight(&key, &state, &self.weigher);
        let shard = self.shard_for(&key);
        let mut map = shard.write();
        if map.contains_key(&key) {
            return false;
        }
        let version = self.next_version();
        map.insert(
            key,
            Slot {
                version,
                state,
                weight,
            },
        );
        self.size.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(weight, Ordering::Relaxed);
        self.counters.inc_insert();
        true
    }

    fn replace_if_equal(&self, key: &Key, expected_version: u64, state: EntryState<V>) -> bool {
        let weight = entry_weight(key, &state, &self.weigher);
        let shard = self.shard_for(key);
        let mut map = shard.write();
        let Some(slot) = map.get_mut(key) else {
            return false;
        };
        if slot.version != expected_version {
            return false;
        }
        let old_weight = slot.weight;
        slot.version = self.next_version();
        slot.state = state;
        slot.weight = weight;
        self.bytes.fetch_add(weight, Ordering::Relaxed);
        self.bytes.fetch_sub(old_weight, Ordering::Relaxed);
        self.counters.inc_replace();
        true
    }

    fn delete_if_equal(&self, key: &Key, expected_version: u64) -> bool {
        let shard = self.shard_for(key);
        let mut map = shard.write();
        match map.get(key) {
            Some(slot) if slot.version == expected_version => {},
            _ => return false,
        }
        let Some(slot) = map.remove(key) else {
            return false;
        };
        self.size.fetch_sub(1, Ordering::Relaxed);
        self.bytes.fetch_sub(slot.weight, Ordering::Relaxed);
        self.counters.inc_removes(1);
        true
    }

    fn lookup(&self, key: &Key) -> Option<VersionedEntry<V>> {
        let shard = self.shard_for(key);
        let map = shard.read();
        match map.get(key) {
            Some(slot) => {
                self.counters.inc_hit();
                Some(VersionedEntry {
                    version: slot.version,
                    state: slot.state.clone(),
                })
            },
            None => {
                self.counters.inc_miss();
                None
            },
        }
    }

    fn select_delete(&self, pred: &mut dyn FnMut(&Key, &EntryState<V>) -> bool) -> usize {
        let mut removed = 0;
        let mut freed = 0;
        for shard in &self.shards {
            let mut map = shard.write();
            map.retain(|key, slot| {
                if pred(key, &slot.state) {
                    removed += 1;
                    freed += slot.weight;
                    false
                } else {
                    true
                }
            });
        }
        if removed > 0 {
            self.size.fetch_sub(removed, Ordering::Relaxed);
            self.bytes.fetch_sub(freed, Ordering::Relaxed);
            self.counters.inc_removes(removed as u64);
        }
        removed
    }

    fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    fn used_bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    fn metrics(&self) -> StoreMetrics {
        self.counters.snapshot()
    }
}
