pub use crate::builder::{MemoBuilder, MemoConfig, StrategyKind};
pub use crate::coordinator::{CacheMetrics, CallOptions, MemoCache, StoreChoice};
pub use crate::error::ConfigError;
pub use crate::key::Key;
pub use crate::store::{StoreMetrics, Weigher};
pub use crate::strategy::{CacheStrategy, EntryContext, ReadOutcome};
