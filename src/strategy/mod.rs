//! Pluggable cache strategies.
//!
//! Stores own the rows; strategies own the cache policy. A strategy is
//! consulted at exactly three points of an entry's life:
//!
//! - **insert** (`on_cache`): the runner just computed a value; the
//!   strategy returns the context stored alongside it and may perform
//!   admission work (threshold GC, deadline registration).
//! - **read** (`on_read`): a caller found a completed row; the strategy
//!   may veto the read (`Retry`) after invalidating, or account the read
//!   and accept it.
//! - **invalidate/GC**: explicit removal and background sweeps.
//!
//! Strategy operations never touch `Running` rows; an in-flight
//! computation is the coordinator's property until it reaches a terminal
//! state.
//!
//! Two strategies are provided: [`DefaultStrategy`] (TTL per entry) and
//! [`EvictionStrategy`] (byte-bounded LRU with optional TTL). Each engine
//! holds two instances of its configured strategy, one over the primary
//! sharded table and one over its persistent-store twin.

pub mod default;
pub mod eviction;

use std::sync::Arc;
use std::time::Instant;

use crate::coordinator::CallOptions;
use crate::key::Key;
use crate::store::traits::EntryStore;

pub use default::DefaultStrategy;
pub use eviction::EvictionStrategy;

/// Strategy-supplied metadata stored with a completed value.
///
/// Opaque to the coordinator: it stores the context at completion and
/// hands it back on every read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryContext {
    /// Absolute expiry deadline, `None` for "never expires".
    ExpiresAt(Option<Instant>),
    /// Whether the entry is exempt from LRU ranking.
    Permanent(bool),
}

/// Verdict of a strategy's read hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The entry is valid; return it to the caller.
    Ok,
    /// The entry was invalidated (expired, evicted); re-enter dispatch.
    Retry,
}

/// Capability trait for cache strategies.
///
/// Dyn-safe so the engine can hold its configured strategy behind
/// `Arc<dyn CacheStrategy<V>>`. All methods take `&self`; strategy state
/// is internally synchronized.
pub trait CacheStrategy<V>: Send + Sync {
    /// The backing store this strategy instance manages.
    fn store(&self) -> &Arc<dyn EntryStore<V>>;

    /// Called by the runner right before its completion CAS.
    ///
    /// Returns the context to be stored with the value. May synchronously
    /// garbage-collect when admission would cross a byte threshold.
    fn on_cache(&self, key: &Key, value: &Arc<V>, opts: &CallOptions) -> EntryContext;

    /// Called on every read of a completed row.
    ///
    /// Returning [`ReadOutcome::Retry`] means the strategy already
    /// invalidated the entry and the caller must re-enter dispatch.
    fn on_read(&self, key: &Key, value: &Arc<V>, ctx: &EntryContext) -> ReadOutcome;

    /// Removes every completed entry. Returns the count removed.
    fn invalidate_all(&self) -> usize;

    /// Removes the completed entry for `key`, if any. Returns 0 or 1.
    fn invalidate(&self, key: &Key) -> usize;

    /// Runs the strategy's garbage collection. Returns the count removed.
    fn garbage_collect(&self) -> usize;
}
