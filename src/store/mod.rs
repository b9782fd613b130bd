pub mod global;
pub mod table;
pub mod traits;

pub use global::GlobalStore;
pub use table::TableStore;
pub use traits::{
    EntryState, EntryStore, RunnerId, RunnerToken, StoreMetrics, VersionedEntry, Weigher,
    default_weigher,
};
