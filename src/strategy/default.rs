//! Default cache strategy: per-entry TTL.
//!
//! Each completed entry carries an absolute expiry deadline (or none). The
//! deadline is taken from the call options, falling back to the engine's
//! `default_expires_in`. Reads of a strictly-expired entry invalidate it
//! and ask the caller to retry, so an expired value is never returned
//! without a fresh thunk invocation. Garbage collection is a sweep over
//! completed rows with a past deadline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::coordinator::CallOptions;
use crate::key::Key;
use crate::store::traits::{EntryState, EntryStore};
use crate::strategy::{CacheStrategy, EntryContext, ReadOutcome};

/// TTL strategy over one backing store.
pub struct DefaultStrategy<V> {
    store: Arc<dyn EntryStore<V>>,
    default_expires_in: Option<Duration>,
}

impl<V> DefaultStrategy<V> {
    /// Creates the strategy over `store`, merging `default_expires_in`
    /// into entries cached without a per-call deadline.
    pub fn new(store: Arc<dyn EntryStore<V>>, default_expires_in: Option<Duration>) -> Self {
        Self {
            store,
            default_expires_in,
        }
    }

    fn deadline_for(&self, opts: &CallOptions) -> Option<Instant> {
        opts.expires_in
            .or(self.default_expires_in)
            .map(|ttl| Instant::now() + ttl)
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
}

impl<V> CacheStrategy<V> for DefaultStrategy<V>
where
    V: Send + Sync,
{
    fn store(&self) -> &Arc<dyn EntryStore<V>> {
        &self.store
    }

    fn on_cache(&self, _key: &Key, _value: &Arc<V>, opts: &CallOptions) -> EntryContext {
        EntryContext::ExpiresAt(self.deadline_for(opts))
    }

    fn on_read(&self, key: &Key, _value: &Arc<V>, ctx: &EntryContext) -> ReadOutcome {
        match ctx {
            EntryContext::ExpiresAt(Some(deadline)) if Instant::now() > *deadline => {
                self.invalidate(key);
                ReadOutcome::Retry
            },
            _ => ReadOutcome::Ok,
        }
    }

    fn invalidate_all(&self) -> usize {
        let removed = self
            .store
            .select_delete(&mut |_, state| state.is_completed());
        debug!(removed, "invalidated all completed entries");
        removed
    }

    fn invalidate(&self, key: &Key) -> usize {
        self.delete_completed(key)
    }

    fn garbage_collect(&self) -> usize {
        let now = Instant::now();
        let removed = self.store.select_delete(&mut |_, state| {
            matches!(
                state,
                EntryState::Completed {
                    ctx: EntryContext::ExpiresAt(Some(deadline)),
                    ..
                } if *deadline < now
            )
        });
        if removed > 0 {
            debug!(removed, "swept expired entries");
        }
        removed
    }
}
