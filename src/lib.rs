//! memokit: concurrent memoization with pluggable cache strategies.
//!
//! `get_or_run` computes a key's value at most once across concurrent
//! callers: one thread runs the thunk, the rest park until it completes.
//! Completed values are cached under a strategy (per-entry TTL or
//! byte-bounded LRU) in either an engine-lifetime table or a
//! process-global store.

pub mod builder;
pub mod coordinator;
pub mod ds;
pub mod error;
pub mod key;
pub mod prelude;
pub mod store;
pub mod strategy;
