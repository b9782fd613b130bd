//! Engine settings and the validating builder.
//!
//! Wires a [`MemoCache`](crate::coordinator::MemoCache) from a settings
//! record: one strategy kind instantiated twice, over the primary sharded
//! table and over its persistent-store twin, sharing one weigher.
//!
//! ## Example
//!
//! ```
//! use memokit::builder::{MemoBuilder, StrategyKind};
//! use memokit::coordinator::{CallOptions, MemoCache};
//!
//! let cache: MemoCache<String> = MemoBuilder::new()
//!     .strategy(StrategyKind::Eviction)
//!     .max_threshold(10 * 1024 * 1024)
//!     .min_threshold(8 * 1024 * 1024)
//!     .build()
//!     .unwrap();
//!
//! let value = cache.get_or_insert_with("greeting", &CallOptions::new(), || {
//!     "hello".to_owned()
//! });
//! assert_eq!(value.as_str(), "hello");
//! ```
//!
//! ## Settings
//!
//! | Field                | Default     | Meaning                                  |
//! |----------------------|-------------|------------------------------------------|
//! | `strategy`           | `Default`   | TTL (`Default`) or LRU (`Eviction`)      |
//! | `max_threshold`      | unbounded   | byte ceiling triggering GC on admission  |
//! | `min_threshold`      | unset       | byte floor GC sweeps down to             |
//! | `max_waiters`        | 20          | parked callers per in-flight key         |
//! | `waiter_sleep`       | 200 ms      | backoff when the waiters list is full    |
//! | `default_expires_in` | none        | TTL merged into `Default`-strategy inserts |
//! | `shards`             | 8           | lock shards of the primary table         |
//! | `name`               | `"memokit"` | namespace of the persistent store        |

use std::sync::Arc;
use std::time::Duration;

use crate::coordinator::MemoCache;
use crate::error::ConfigError;
use crate::store::traits::{EntryStore, Weigher, default_weigher};
use crate::store::{GlobalStore, TableStore};
use crate::strategy::{CacheStrategy, DefaultStrategy, EvictionStrategy};

/// Available cache strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyKind {
    /// Per-entry TTL with sweep-based GC.
    #[default]
    Default,
    /// Byte-bounded LRU with optional per-entry TTL.
    Eviction,
}

/// Validated engine settings.
#[derive(Debug, Clone)]
pub struct MemoConfig {
    /// Which cache strategy the engine runs.
    pub strategy: StrategyKind,
    /// Byte ceiling; `None` means unbounded.
    pub max_threshold: Option<usize>,
    /// Byte floor GC sweeps down to. Meaningful only with a ceiling.
    pub min_threshold: Option<usize>,
    /// Parked callers allowed per in-flight key. `0` is treated as 1.
    pub max_waiters: usize,
    /// Backoff before a capped caller re-dispatches.
    pub waiter_sleep: Duration,
    /// TTL merged into inserts under the `Default` strategy.
    pub default_expires_in: Option<Duration>,
    /// Lock shards of the primary table.
    pub shards: usize,
    /// Namespace of the persistent store variant.
    pub name: String,
}

impl Default for MemoConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Default,
            max_threshold: None,
            min_threshold: None,
            max_waiters: 20,
            waiter_sleep: Duration::from_millis(200),
            default_expires_in: None,
            shards: 8,
            name: "memokit".to_owned(),
        }
    }
}

/// Builder for [`MemoCache`].
#[derive(Debug, Clone, Default)]
pub struct MemoBuilder {
    config: MemoConfig,
}

impl MemoBuilder {
    /// Starts from default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects the cache strategy.
    pub fn strategy(mut self, strategy: StrategyKind) -> Self {
        self.config.strategy = strategy;
        self
    }

    /// Sets the byte ceiling that triggers GC on admission.
    pub fn max_threshold(mut self, bytes: usize) -> Self {
        self.config.max_threshold = Some(bytes);
        self
    }

    /// Sets the byte floor GC sweeps down to.
    pub fn min_threshold(mut self, bytes: usize) -> Self {
        self.config.min_threshold = Some(bytes);
        self
    }

    /// Caps the parked callers per in-flight key.
    pub fn max_waiters(mut self, max_waiters: usize) -> Self {
        self.config.max_waiters = max_waiters;
        self
    }

    /// Sets the backoff before a capped caller re-dispatches.
    pub fn waiter_sleep(mut self, sleep: Duration) -> Self {
        self.config.waiter_sleep = sleep;
        self
    }

    /// Sets the TTL merged into `Default`-strategy inserts.
    pub fn default_expires_in(mut self, ttl: Duration) -> Self {
        self.config.default_expires_in = Some(ttl);
        self
    }

    /// Sets the number of lock shards of the primary table.
    ///
    /// Rounded up to a power of two by the table's stripe selector.
    pub fn shards(mut self, shards: usize) -> Self {
        self.config.shards = shards;
        self
    }

    /// Names the persistent-store namespace.
    ///
    /// Engines sharing a name share persistently cached entries.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Builds the engine with the default shallow-size weigher.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for inconsistent settings: zero shards, a
    /// ceiling without a floor (or the reverse), or a floor above the
    /// ceiling.
    pub fn build<V>(self) -> Result<MemoCache<V>, ConfigError>
    where
        V: Send + Sync + 'static,
    {
        self.build_with_weigher(default_weigher())
    }

    /// Builds the engine with a caller-supplied value weigher.
    ///
    /// The weigher feeds the byte accounting of both store variants; use
    /// it when values own heap data the shallow size misses.
    ///
    /// # Errors
    ///
    /// Same validation as [`build`](Self::build).
    pub fn build_with_weigher<V>(self, weigher: Weigher<V>) -> Result<MemoCache<V>, ConfigError>
    where
        V: Send + Sync + 'static,
    {
        let config = self.config;
        if config.shards == 0 {
            return Err(ConfigError::new("shards must be > 0"));
        }
        match (config.max_threshold, config.min_threshold) {
            (Some(_), None) => {
                return Err(ConfigError::new(
                    "min_threshold is required when max_threshold is set",
                ));
            },
            (None, Some(_)) => {
                return Err(ConfigError::new(
                    "min_threshold requires max_threshold to be set",
                ));
            },
            (Some(max), Some(min)) if min > max => {
                return Err(ConfigError::new(
                    "min_threshold must not exceed max_threshold",
                ));
            },
            _ => {},
        }

        let primary: Arc<dyn EntryStore<V>> =
            Arc::new(TableStore::new(config.shards, Arc::clone(&weigher)));
        let persistent: Arc<dyn EntryStore<V>> =
            Arc::new(GlobalStore::new(config.name.clone(), weigher));

        let (primary, persistent): (Arc<dyn CacheStrategy<V>>, Arc<dyn CacheStrategy<V>>) =
            match config.strategy {
                StrategyKind::Default => (
                    Arc::new(DefaultStrategy::new(primary, config.default_expires_in)),
                    Arc::new(DefaultStrategy::new(persistent, config.default_expires_in)),
                ),
                StrategyKind::Eviction => {
                    let min = config.min_threshold.unwrap_or(0);
                    (
                        Arc::new(EvictionStrategy::new(primary, config.max_threshold, min)),
                        Arc::new(EvictionStrategy::new(
                            persistent,
                            config.max_threshold,
                            min,
                        )),
                    )
                },
            };

        Ok(MemoCache::from_parts(config, primary, persistent))
    }
}
