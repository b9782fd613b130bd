pub mod deadline_index;
pub mod once_signal;
pub mod shard;

pub use deadline_index::DeadlineIndex;
pub use once_signal::{OnceSignal, Outcome};
pub use shard::ShardSelector;
