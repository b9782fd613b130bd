//! Backing-store contract for per-key entry rows.
//!
//! A row is `(key, entry state)` plus a version stamp. Every state
//! transition the coordinator performs is a compare-and-swap against the
//! version observed at lookup time, so losing callers never corrupt state;
//! they observe the new world and re-enter dispatch.
//!
//! ## Architecture
//!
//! ```text
//!  per-key lifecycle (each arrow is a single CAS):
//!
//!    absent ──insert_if_absent──► Running { runner, waiters }
//!       ▲                             │
//!       │                             │ replace_if_equal
//!       ├──delete_if_equal────────────┤
//!       │   (thunk failed,            ▼
//!       │    runner died)         Completed { value, ctx }
//!       └──delete_if_equal / select_delete── (invalidate, GC)
//! ```
//!
//! Two implementations share this contract: the sharded in-memory table
//! ([`TableStore`](crate::store::table::TableStore), the primary path) and
//! the process-global named-value store
//! ([`GlobalStore`](crate::store::global::GlobalStore), the persistent
//! path). The persistent variant is allowed a coarser single-lock CAS
//! because every caller re-validates after a failed expectation.
//!
//! ## Version stamps
//!
//! `replace_if_equal` and `delete_if_equal` compare a `u64` stamp that each
//! write refreshes from a per-store counter. A matched stamp identifies the
//! exact row value the caller observed, which gives the same conditional
//! guarantee as comparing the full row without requiring equality on
//! waiter handles.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::ds::OnceSignal;
use crate::key::Key;
use crate::strategy::EntryContext;

// =============================================================================
// Runner identity
// =============================================================================

/// Identity of one `get_or_run` execution that won the race to compute.
///
/// Drawn from a process-global counter, never a thread id, so a CAS check
/// can never confuse a new runner with an old one that happens to share an
/// execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunnerId(u64);

impl RunnerId {
    /// Allocates a fresh, process-unique runner identity.
    pub fn next() -> RunnerId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        RunnerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Liveness token owned by a running computation's guard.
///
/// The `Running` row stores a `Weak` to this token; a failed upgrade means
/// the runner's guard was dropped without completing, i.e. the runner died.
#[derive(Debug)]
pub struct RunnerToken {
    runner: RunnerId,
}

impl RunnerToken {
    /// Creates a token for the given runner.
    pub fn new(runner: RunnerId) -> Arc<RunnerToken> {
        Arc::new(RunnerToken { runner })
    }

    /// Returns the runner this token belongs to.
    pub fn runner(&self) -> RunnerId {
        self.runner
    }
}

// =============================================================================
// Entry state
// =============================================================================

/// Per-key entry state. Absence from the store means "not cached".
pub enum EntryState<V> {
    /// A computation is in flight.
    Running {
        /// Identity of the caller executing the thunk.
        runner: RunnerId,
        /// Liveness watch; dead when the runner's guard dropped.
        alive: Weak<RunnerToken>,
        /// Signals of callers parked on this computation.
        waiters: Vec<Arc<OnceSignal>>,
    },
    /// A value is cached. Immutable until removal.
    Completed {
        /// The memoized value.
        value: Arc<V>,
        /// Strategy-attached metadata, opaque to the coordinator.
        ctx: EntryContext,
    },
}

impl<V> EntryState<V> {
    /// Returns `true` for in-flight entries.
    pub fn is_running(&self) -> bool {
        matches!(self, EntryState::Running { .. })
    }

    /// Returns `true` for cached entries.
    pub fn is_completed(&self) -> bool {
        matches!(self, EntryState::Completed { .. })
    }
}

impl<V> Clone for EntryState<V> {
    fn clone(&self) -> Self {
        match self {
            EntryState::Running {
                runner,
                alive,
                waiters,
            } => EntryState::Running {
                runner: *runner,
                alive: alive.clone(),
                waiters: waiters.clone(),
            },
            EntryState::Completed { value, ctx } => EntryState::Completed {
                value: Arc::clone(value),
                ctx: ctx.clone(),
            },
        }
    }
}

impl<V> std::fmt::Debug for EntryState<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryState::Running {
                runner, waiters, ..
            } => f
                .debug_struct("Running")
                .field("runner", runner)
                .field("waiters", &waiters.len())
                .finish(),
            EntryState::Completed { ctx, .. } => {
                f.debug_struct("Completed").field("ctx", ctx).finish()
            },
        }
    }
}

/// A row as observed at lookup time: the state plus its version stamp.
#[derive(Debug, Clone)]
pub struct VersionedEntry<V> {
    /// Stamp identifying this exact row value.
    pub version: u64,
    /// The entry state at lookup time.
    pub state: EntryState<V>,
}

// =============================================================================
// Weighing
// =============================================================================

/// Computes the byte cost of a cached value for threshold accounting.
pub type Weigher<V> = Arc<dyn Fn(&V) -> usize + Send + Sync>;

/// Weigher charging each value its shallow size.
pub fn default_weigher<V>() -> Weigher<V> {
    Arc::new(|_: &V| std::mem::size_of::<V>())
}

/// Fixed bookkeeping cost charged per row.
const ROW_OVERHEAD: usize = std::mem::size_of::<u64>() + 2 * std::mem::size_of::<usize>();

/// Estimates the byte footprint of one row.
///
/// Running rows carry their waiter handles; completed rows carry the
/// weighed value. The estimate moves monotonically with insertions and
/// deletions, which is all the threshold accounting requires.
pub(crate) fn entry_weight<V>(key: &Key, state: &EntryState<V>, weigher: &Weigher<V>) -> usize {
    let state_weight = match state {
        EntryState::Running { waiters, .. } => {
            waiters.len() * std::mem::size_of::<Arc<OnceSignal>>()
        },
        EntryState::Completed { value, .. } => weigher(value),
    };
    key.weight() + state_weight + ROW_OVERHEAD
}

// =============================================================================
// Metrics counters
// =============================================================================

/// Snapshot of store-level metrics. All fields are cumulative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreMetrics {
    /// Lookups that found a row.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Rows created by `insert_if_absent`.
    pub inserts: u64,
    /// Rows replaced by a successful CAS.
    pub replaces: u64,
    /// Rows removed by `delete_if_equal` or `select_delete`.
    pub removes: u64,
}

/// Store metrics counters using atomics for thread-safe updates.
#[derive(Debug, Default)]
pub(crate) struct StoreCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    replaces: AtomicU64,
    removes: AtomicU64,
}

impl StoreCounters {
    pub(crate) fn snapshot(&self) -> StoreMetrics {
        StoreMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            replaces: self.replaces.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn inc_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_replace(&self) {
        self.replaces.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_removes(&self, n: u64) {
        self.removes.fetch_add(n, Ordering::Relaxed);
    }
}

// =============================================================================
// Store trait
// =============================================================================

/// Atomic row primitives shared by the primary and persistent variants.
///
/// Uses interior mutability throughout; methods take `&self` so a store
/// can be shared behind an `Arc` across caller threads.
pub trait EntryStore<V>: Send + Sync {
    /// Creates a row if the key is absent. Returns `false` if a row exists.
    fn insert_if_absent(&self, key: Key, state: EntryState<V>) -> bool;

    /// Replaces the row if its version still matches `expected_version`.
    ///
    /// Returns `false` (and changes nothing) on a lost race or a missing
    /// row.
    fn replace_if_equal(&self, key: &Key, expected_version: u64, state: EntryState<V>) -> bool;

    /// Deletes the row if its version still matches `expected_version`.
    fn delete_if_equal(&self, key: &Key, expected_version: u64) -> bool;

    /// Returns a clone of the row for `key`, if present.
    fn lookup(&self, key: &Key) -> Option<VersionedEntry<V>>;

    /// Deletes every row matching `pred` and returns the count removed.
    ///
    /// Used for bulk invalidation and GC sweeps. Rows inserted while the
    /// sweep runs may survive it.
    fn select_delete(&self, pred: &mut dyn FnMut(&Key, &EntryState<V>) -> bool) -> usize;

    /// Returns the current number of rows.
    fn len(&self) -> usize;

    /// Returns `true` if the store holds no rows.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the estimated byte footprint of all rows.
    fn used_bytes(&self) -> usize;

    /// Returns a snapshot of the store's metrics.
    fn metrics(&self) -> StoreMetrics;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_ids_are_unique() {
        let a = RunnerId::next();
        let b = RunnerId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn token_weak_dies_with_guard() {
        let runner = RunnerId::next();
        let token = RunnerToken::new(runner);
        assert_eq!(token.runner(), runner);
        let watch = Arc::downgrade(&token);
        assert!(watch.upgrade().is_some());
        drop(token);
        assert!(watch.upgrade().is_none());
    }

    #[test]
    fn completed_rows_weigh_their_value() {
        let weigher: Weigher<Vec<u8>> = Arc::new(|v: &Vec<u8>| v.len());
        let key = Key::from("k");
        let small = EntryState::Completed {
            value: Arc::new(vec![0u8; 10]),
            ctx: EntryContext::Permanent(false),
        };
        let large = EntryState::Completed {
            value: Arc::new(vec![0u8; 1000]),
            ctx: EntryContext::Permanent(false),
        };
        let delta = entry_weight(&key, &large, &weigher) - entry_weight(&key, &small, &weigher);
        assert_eq!(delta, 990);
    }

    #[test]
    fn state_predicates() {
        let running: EntryState<u32> = EntryState::Running {
            runner: RunnerId::next(),
            alive: Weak::new(),
            waiters: Vec::new(),
        };
        let completed: EntryState<u32> = EntryState::Completed {
            value: Arc::new(5),
            ctx: EntryContext::ExpiresAt(None),
        };
        assert!(running.is_running() && !running.is_completed());
        assert!(completed.is_completed() && !completed.is_running());
    }
}
