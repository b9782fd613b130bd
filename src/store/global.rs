//! Process-global named-value store: the persistent backing-store variant.
//!
//! Rows live in a single process-wide registry keyed by `(namespace, key)`,
//! so they survive individual engine instances: a new [`GlobalStore`] bound
//! to the same namespace sees rows cached through an earlier one. Nothing
//! survives the process; this is the "persistent" variant only in the
//! process-lifetime sense.
//!
//! All mutations happen under one registry lock, which makes the CAS
//! primitives coarser-grained than the sharded table's. That is sufficient
//! for the coordinator's protocol: every caller treats a failed expectation
//! as a lost race and re-dispatches, so put-or-erase atomicity is all the
//! contract requires.
//!
//! A namespace must be used with a single value type. Rows written under a
//! different type are treated as absent by lookups and overwritten by
//! inserts.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::key::Key;
use crate::store::traits::{
    EntryState, EntryStore, StoreCounters, StoreMetrics, VersionedEntry, Weigher, entry_weight,
};

// =============================================================================
// Registry
// =============================================================================

struct GlobalSlot {
    version: u64,
    weight: usize,
    state: Box<dyn Any + Send + Sync>,
}

#[derive(Default)]
struct Registry {
    rows: FxHashMap<(String, Key), GlobalSlot>,
    /// Byte totals per namespace, maintained on every mutation.
    weights: FxHashMap<String, usize>,
}

impl Registry {
    fn credit(&mut self, namespace: &str, weight: usize) {
        *self.weights.entry(namespace.to_owned()).or_insert(0) += weight;
    }

    fn debit(&mut self, namespace: &str, weight: usize) {
        if let Some(total) = self.weights.get_mut(namespace) {
            *total = total.saturating_sub(weight);
        }
    }
}

fn registry() -> &'static RwLock<Registry> {
    static REGISTRY: OnceLock<RwLock<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(Registry::default()))
}

fn next_version() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    NEXT.fetch_add(1, Ordering::Relaxed) + 1
}

// =============================================================================
// GlobalStore
// =============================================================================

/// Handle to one namespace of the process-global registry.
pub struct GlobalStore<V> {
    namespace: String,
    weigher: Weigher<V>,
    counters: StoreCounters,
    _marker: PhantomData<fn() -> V>,
}

impl<V> std::fmt::Debug for GlobalStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalStore")
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl<V> GlobalStore<V>
where
    V: Send + Sync + 'static,
{
    /// Binds a store handle to `namespace`.
    ///
    /// Handles bound to the same namespace share rows; dropping a handle
    /// leaves the rows in place.
    pub fn new(namespace: impl Into<String>, weigher: Weigher<V>) -> Self {
        Self {
            namespace: namespace.into(),
            weigher,
            counters: StoreCounters::default(),
            _marker: PhantomData,
        }
    }

    /// Returns the namespace this handle is bound to.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn row_key(&self, key: &Key) -> (String, Key) {
        (self.namespace.clone(), key.clone())
    }

    fn downcast(slot: &GlobalSlot) -> Option<&EntryState<V>> {
        slot.state.downcast_ref::<EntryState<V>>()
    }
}

impl<V> EntryStore<V> for GlobalStore<V>
where
    V: Send + Sync + 'static,
{
    fn insert_if_absent(&self, key: Key, state: EntryState<V>) -> bool {
        let weight = entry_weight(&key, &state, &self.weigher);
        let mut registry = registry().write();
        let row_key = (self.namespace.clone(), key);
        if let Some(existing) = registry.rows.get(&row_key) {
            if Self::downcast(existing).is_some() {
                return false;
            }
            // Foreign-typed leftover; reclaim the row.
            let stale = existing.weight;
            registry.debit(&self.namespace, stale);
            registry.rows.remove(&row_key);
        }
        registry.rows.insert(
            row_key,
            GlobalSlot {
                version: next_version(),
                weight,
                state: Box::new(state),
            },
        );
        registry.credit(&self.namespace, weight);
        self.counters.inc_insert();
        true
    }

    fn replace_if_equal(&self, key: &Key, expected_version: u64, state: EntryState<V>) -> bool {
        let weight = entry_weight(key, &state, &self.weigher);
        let mut registry = registry().write();
        let row_key = self.row_key(key);
        let Some(slot) = registry.rows.get_mut(&row_key) else {
            return false;
        };
        if slot.version != expected_version || Self::downcast(slot).is_none() {
            return false;
        }
        let old_weight = slot.weight;
        slot.version = next_version();
        slot.weight = weight;
        slot.state = Box::new(state);
        registry.credit(&self.namespace, weight);
        registry.debit(&self.namespace, old_weight);
        self.counters.inc_replace();
        true
    }

    fn delete_if_equal(&self, key: &Key, expected_version: u64) -> bool {
        let mut registry = registry().write();
        let row_key = self.row_key(key);
        match registry.rows.get(&row_key) {
            Some(slot) if slot.version == expected_version => {},
            _ => return false,
        }
        let Some(slot) = registry.rows.remove(&row_key) else {
            return false;
        };
        registry.debit(&self.namespace, slot.weight);
        self.counters.inc_removes(1);
        true
    }

    fn lookup(&self, key: &Key) -> Option<VersionedEntry<V>> {
        let registry = registry().read();
        let row_key = self.row_key(key);
        match registry.rows.get(&row_key).and_then(|slot| {
            Self::downcast(slot).map(|state| VersionedEntry {
                version: slot.version,
                state: state.clone(),
            })
        }) {
            Some(row) => {
                self.counters.inc_hit();
                Some(row)
            },
            None => {
                self.counters.inc_miss();
                None
            },
        }
    }

    fn select_delete(&self, pred: &mut dyn FnMut(&Key, &EntryState<V>) -> bool) -> usize {
        let mut registry = registry().write();
        let mut removed = 0;
        let mut freed = 0;
        registry.rows.retain(|(namespace, key), slot| {
            if namespace != &self.namespace {
                return true;
            }
            let Some(state) = slot.state.downcast_ref::<EntryState<V>>() else {
                return true;
            };
            if pred(key, state) {
                removed += 1;
                freed += slot.weight;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            registry.debit(&self.namespace, freed);
            self.counters.inc_removes(removed as u64);
        }
        removed
    }

    fn len(&self) -> usize {
        let registry = registry().read();
        registry
            .rows
            .keys()
            .filter(|(namespace, _)| namespace == &self.namespace)
            .count()
    }

    fn used_bytes(&self) -> usize {
        let registry = registry().read();
        registry
            .weights
            .get(&self.namespace)
            .copied()
            .unwrap_or(0)
    }

    fn metrics(&self) -> StoreMetrics {
        self.counters.snapshot()
    }
}
