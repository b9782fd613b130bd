//! The per-key state machine behind `get_or_run`.
//!
//! ## Architecture
//!
//! ```text
//!                       ┌──────────────────────────────────────────────┐
//!                       │            dispatch loop (one caller)        │
//!                       └──────────────────────────────────────────────┘
//!                                          │ lookup(key)
//!            ┌─────────────────────────────┼─────────────────────────────┐
//!            ▼                             ▼                             ▼
//!        absent                     Running(r, W)                 Completed(v, ctx)
//!            │                             │                             │
//!   insert_if_absent(Running)     |W| < max_waiters?              strategy.on_read
//!      won │    │ lost           yes │         │ no                 Ok │    │ Retry
//!          ▼    └──► restart  CAS-append self  sleep(waiter_sleep)     ▼    └──► restart
//!    run thunk                 + liveness check    └──► restart     return v
//!      │        │                    │
//!  Ok(value)  Err/panic       wait ≤ 5000 ms for
//!      │        │             Completed/Failed/timeout ──► restart
//!  on_cache     │
//!  CAS → Completed, notify W  CAS → absent, notify W Failed,
//!  restart (hits on_read)     re-raise preserving kind
//! ```
//!
//! Every transition is a version-checked CAS, so a losing caller never
//! corrupts state; it observes the new world and re-enters the loop. The
//! completion path deliberately restarts dispatch instead of returning the
//! freshly computed value: the strategy's read hook then observes the
//! value at least once and can veto it (a zero TTL retries correctly).
//!
//! ## Runner liveness
//!
//! The `Running` row stores a `Weak` to a token owned by the runner's
//! guard. A waiter checks the watch right after CAS-appending itself (a
//! runner that died between the append and the check would otherwise strand
//! the waiter) and again when its bounded wait times out. The first waiter
//! to observe a dead runner clears the row and broadcasts `Failed`; the
//! guard itself performs the same cleanup on any unwind the runner did not
//! handle.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, trace};

use crate::builder::{MemoBuilder, MemoConfig};
use crate::ds::{OnceSignal, Outcome};
use crate::key::Key;
use crate::store::traits::{EntryState, EntryStore, RunnerId, RunnerToken, StoreMetrics};
use crate::strategy::{CacheStrategy, EntryContext, ReadOutcome};

/// Bound on one parked wait. A liveness patch, not a result deadline: a
/// waiter that times out simply re-dispatches.
const WAIT_TIMEOUT: Duration = Duration::from_millis(5000);

// =============================================================================
// Call-site options
// =============================================================================

/// Which backing-store variant a call operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreChoice {
    /// The engine-lifetime sharded table.
    #[default]
    Primary,
    /// The process-global named-value store.
    Persistent,
}

/// Per-call options for [`MemoCache::get_or_run`].
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Backing-store variant to use.
    pub cache: StoreChoice,
    /// TTL attached to the entry at insert time.
    pub expires_in: Option<Duration>,
    /// Exempts the entry from LRU ranking under the eviction strategy.
    pub permanent: bool,
}

impl CallOptions {
    /// Creates default options: primary store, no TTL, not permanent.
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects the backing-store variant.
    pub fn cache(mut self, choice: StoreChoice) -> Self {
        self.cache = choice;
        self
    }

    /// Attaches a TTL to the cached entry.
    pub fn expires_in(mut self, ttl: Duration) -> Self {
        self.expires_in = Some(ttl);
        self
    }

    /// Marks the entry permanent (exempt from LRU ranking).
    pub fn permanent(mut self, permanent: bool) -> Self {
        self.permanent = permanent;
        self
    }
}

/// Metrics snapshots for both backing-store variants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    /// Counters of the primary table.
    pub primary: StoreMetrics,
    /// Counters of the persistent store.
    pub persistent: StoreMetrics,
}

// =============================================================================
// Runner guard
// =============================================================================

/// Cleanup guard held while a runner owns a `Running` row.
///
/// Owns the liveness token. If dropped without being disarmed (thunk
/// error, panic, or any unwind before completion), it clears the row and
/// broadcasts `Failed` so no waiter is stranded.
struct RunnerGuard<'a, V> {
    store: &'a Arc<dyn EntryStore<V>>,
    key: &'a Key,
    runner: RunnerId,
    token: Option<Arc<RunnerToken>>,
    armed: bool,
}

impl<'a, V> RunnerGuard<'a, V> {
    fn new(
        store: &'a Arc<dyn EntryStore<V>>,
        key: &'a Key,
        runner: RunnerId,
        token: Arc<RunnerToken>,
    ) -> Self {
        Self {
            store,
            key,
            runner,
            token: Some(token),
            armed: true,
        }
    }

    /// Marks the computation as handled; drop becomes a no-op.
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<V> Drop for RunnerGuard<'_, V> {
    fn drop(&mut self) {
        // Kill the liveness watch first so late observers agree.
        self.token = None;
        if !self.armed {
            return;
        }
        clear_running_row(self.store, self.key, self.runner);
    }
}

/// CAS-clears the `Running` row owned by `runner` and fans out `Failed`.
///
/// Retries until the CAS lands (the waiters list may grow between lookup
/// and CAS). Gives up silently if the row is no longer this runner's.
fn clear_running_row<V>(store: &Arc<dyn EntryStore<V>>, key: &Key, runner: RunnerId) {
    loop {
        let Some(row) = store.lookup(key) else {
            return;
        };
        let EntryState::Running {
            runner: owner,
            waiters,
            ..
        } = &row.state
        else {
            return;
        };
        if *owner != runner {
            return;
        }
        let waiters = waiters.clone();
        if store.delete_if_equal(key, row.version) {
            trace!(?key, ?runner, waiters = waiters.len(), "cleared failed run");
            for waiter in waiters {
                waiter.set(Outcome::Failed);
            }
            return;
        }
    }
}

// =============================================================================
// MemoCache
// =============================================================================

/// The memoization engine.
///
/// Computes each key's value at most once per cached lifetime across all
/// concurrent callers. Cloning is cheap and shares all state, so an engine
/// can be handed to any number of threads.
///
/// # Example
///
/// ```
/// use memokit::coordinator::{CallOptions, MemoCache};
///
/// let cache: MemoCache<String> = MemoCache::<String>::builder().build().unwrap();
///
/// let value = cache.get_or_insert_with("user:42", &CallOptions::new(), || {
///     // Expensive computation; runs at most once per cached lifetime.
///     "profile".to_owned()
/// });
/// assert_eq!(value.as_str(), "profile");
///
/// // A second caller reads the cached value; its thunk never runs.
/// let again = cache.get_or_insert_with("user:42", &CallOptions::new(), || {
///     unreachable!()
/// });
/// assert_eq!(again.as_str(), "profile");
///
/// assert_eq!(cache.invalidate("user:42"), 1);
/// ```
pub struct MemoCache<V> {
    config: MemoConfig,
    primary: Arc<dyn CacheStrategy<V>>,
    persistent: Arc<dyn CacheStrategy<V>>,
}

impl<V> Clone for MemoCache<V> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            primary: Arc::clone(&self.primary),
            persistent: Arc::clone(&self.persistent),
        }
    }
}

impl<V> std::fmt::Debug for MemoCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoCache")
            .field("config", &self.config)
            .field("primary_len", &self.primary.store().len())
            .field("persistent_len", &self.persistent.store().len())
            .finish()
    }
}

impl<V> MemoCache<V>
where
    V: Send + Sync + 'static,
{
    /// Starts building an engine with default settings.
    pub fn builder() -> MemoBuilder {
        MemoBuilder::new()
    }

    pub(crate) fn from_parts(
        config: MemoConfig,
        primary: Arc<dyn CacheStrategy<V>>,
        persistent: Arc<dyn CacheStrategy<V>>,
    ) -> Self {
        Self {
            config,
            primary,
            persistent,
        }
    }

    fn strategy_for(&self, choice: StoreChoice) -> &Arc<dyn CacheStrategy<V>> {
        match choice {
            StoreChoice::Primary => &self.primary,
            StoreChoice::Persistent => &self.persistent,
        }
    }

    /// Returns the memoized value for `key`, computing it with `thunk` if
    /// needed.
    ///
    /// Exactly one concurrent caller executes the thunk; the others park
    /// until it completes and then read the cached value. A thunk error is
    /// returned only to the caller whose execution produced it; parked
    /// callers re-dispatch and may join (or become) a fresh attempt. The
    /// thunk may run again within one call when the strategy vetoes a read
    /// (an already-expired TTL), hence `FnMut`.
    ///
    /// # Errors
    ///
    /// Propagates the thunk's error untouched. Panics inside the thunk are
    /// re-raised with their original payload after the entry is released
    /// and waiters are notified.
    pub fn get_or_run<F, E>(
        &self,
        key: impl Into<Key>,
        opts: &CallOptions,
        mut thunk: F,
    ) -> Result<Arc<V>, E>
    where
        F: FnMut() -> Result<V, E>,
    {
        let key = key.into().normalize();
        let strategy = self.strategy_for(opts.cache);
        let store = strategy.store();

        loop {
            let Some(row) = store.lookup(&key) else {
                // Absent: race to become the runner.
                let runner = RunnerId::next();
                let token = RunnerToken::new(runner);
                let state = EntryState::Running {
                    runner,
                    alive: Arc::downgrade(&token),
                    waiters: Vec::new(),
                };
                if !store.insert_if_absent(key.clone(), state) {
                    continue;
                }
                trace!(?key, ?runner, "won the run");

                let guard = RunnerGuard::new(store, &key, runner, token);
                match panic::catch_unwind(AssertUnwindSafe(&mut thunk)) {
                    Ok(Ok(value)) => {
                        let value = Arc::new(value);
                        let ctx = strategy.on_cache(&key, &value, opts);
                        complete_running_row(store, &key, runner, &value, &ctx);
                        guard.disarm();
                        // Re-enter dispatch so on_read observes the value.
                        continue;
                    },
                    Ok(Err(err)) => {
                        // Guard drop clears the row and notifies waiters.
                        return Err(err);
                    },
                    Err(payload) => {
                        drop(guard);
                        panic::resume_unwind(payload);
                    },
                }
            };

            match row.state {
                EntryState::Running {
                    runner,
                    ref alive,
                    ref waiters,
                } => {
                    let max_waiters = self.config.max_waiters.max(1);
                    if waiters.len() >= max_waiters {
                        thread::sleep(self.config.waiter_sleep);
                        continue;
                    }

                    let slot = Arc::new(OnceSignal::new());
                    let mut joined = waiters.clone();
                    joined.push(Arc::clone(&slot));
                    let next = EntryState::Running {
                        runner,
                        alive: alive.clone(),
                        waiters: joined,
                    };
                    if !store.replace_if_equal(&key, row.version, next) {
                        continue;
                    }
                    trace!(?key, ?runner, "joined as waiter");

                    // The watch must come after the CAS: a runner that died
                    // in between would otherwise never wake us.
                    if alive.upgrade().is_none() {
                        debug!(?key, ?runner, "runner died before waiter parked");
                        clear_running_row(store, &key, runner);
                        continue;
                    }

                    if slot.wait_timeout(WAIT_TIMEOUT).is_none() {
                        // Timeout is not failure; check liveness and retry.
                        if alive.upgrade().is_none() {
                            debug!(?key, ?runner, "runner died while waiter parked");
                            clear_running_row(store, &key, runner);
                        }
                    }
                    continue;
                },
                EntryState::Completed { value, ctx } => {
                    match strategy.on_read(&key, &value, &ctx) {
                        ReadOutcome::Ok => return Ok(value),
                        ReadOutcome::Retry => continue,
                    }
                },
            }
        }
    }

    /// Infallible convenience over [`get_or_run`](Self::get_or_run).
    pub fn get_or_insert_with<F>(&self, key: impl Into<Key>, opts: &CallOptions, mut f: F) -> Arc<V>
    where
        F: FnMut() -> V,
    {
        match self.get_or_run::<_, std::convert::Infallible>(key, opts, || Ok(f())) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    // -- invalidation & GC façade -----------------------------------------

    /// Removes every completed entry from both store variants.
    ///
    /// Returns the summed count.
    pub fn invalidate_all(&self) -> usize {
        self.primary.invalidate_all() + self.persistent.invalidate_all()
    }

    /// Removes the completed entry for `key` from both store variants.
    ///
    /// Returns the summed count (0, 1 or 2).
    pub fn invalidate(&self, key: impl Into<Key>) -> usize {
        let key = key.into().normalize();
        self.primary.invalidate(&key) + self.persistent.invalidate(&key)
    }

    /// Runs garbage collection on both store variants.
    ///
    /// Returns the summed count of entries removed.
    pub fn garbage_collect(&self) -> usize {
        self.primary.garbage_collect() + self.persistent.garbage_collect()
    }

    /// Returns metrics snapshots for both store variants.
    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            primary: self.primary.store().metrics(),
            persistent: self.persistent.store().metrics(),
        }
    }

    #[cfg(test)]
    pub(crate) fn primary_store(&self) -> &Arc<dyn EntryStore<V>> {
        self.primary.store()
    }
}

/// CAS-completes the `Running` row owned by `runner` and fans out
/// `Completed`.
///
/// Retries while the waiters list keeps growing under the CAS; the
/// notified set is always read from the row the CAS actually replaced, so
/// every registered waiter hears exactly one terminal signal.
fn complete_running_row<V>(
    store: &Arc<dyn EntryStore<V>>,
    key: &Key,
    runner: RunnerId,
    value: &Arc<V>,
    ctx: &EntryContext,
) {
    loop {
        let Some(row) = store.lookup(key) else {
            return;
        };
        let EntryState::Running {
            runner: owner,
            waiters,
            ..
        } = &row.state
        else {
            return;
        };
        if *owner != runner {
            return;
        }
        let waiters = waiters.clone();
        let next = EntryState::Completed {
            value: Arc::clone(value),
            ctx: ctx.clone(),
        };
        if store.replace_if_equal(key, row.version, next) {
            trace!(?key, ?runner, waiters = waiters.len(), "completed run");
            for waiter in waiters {
                waiter.set(Outcome::Completed);
            }
            return;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
