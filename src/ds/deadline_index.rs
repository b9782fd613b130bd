//! Deadline-ordered expiration index.
//!
//! Maps `(deadline, unique counter)` to the cache key that expires at that
//! deadline. The `BTreeMap` keeps entries sorted by deadline ascending, so
//! an expiry sweep only ever inspects the head: it pops entries while the
//! head deadline is in the past and stops at the first live one, O(log n)
//! per removal. The counter disambiguates equal deadlines and is unique per
//! insertion, giving a total order.
//!
//! The index is not internally synchronized; the eviction strategy guards
//! it with its own lock. Entries are not removed on invalidation, so a
//! sweep may pop an index row whose cache entry is already gone. Callers
//! treat that as an already-satisfied removal.
//!
//! ## Example
//!
//! ```
//! use std::time::{Duration, Instant};
//! use memokit::ds::DeadlineIndex;
//! use memokit::key::Key;
//!
//! let mut index = DeadlineIndex::new();
//! let now = Instant::now();
//! index.insert(now - Duration::from_millis(1), Key::from("stale"));
//! index.insert(now + Duration::from_secs(60), Key::from("live"));
//!
//! assert_eq!(index.pop_expired(now), Some(Key::from("stale")));
//! assert_eq!(index.pop_expired(now), None);
//! assert_eq!(index.len(), 1);
//! ```

use std::collections::BTreeMap;
use std::time::Instant;

use crate::error::InvariantError;
use crate::key::Key;

/// Ordered index from expiry deadline to cache key.
#[derive(Debug, Default)]
pub struct DeadlineIndex {
    entries: BTreeMap<(Instant, u64), Key>,
    next_seq: u64,
}

impl DeadlineIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `key` as expiring at `deadline`.
    ///
    /// Duplicate deadlines are fine; every insertion gets a fresh counter.
    pub fn insert(&mut self, deadline: Instant, key: Key) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert((deadline, seq), key);
    }

    /// Removes and returns the head entry if its deadline is before `now`.
    ///
    /// Returns `None` when the index is empty or the head is still live,
    /// which is the sweep's stop condition.
    pub fn pop_expired(&mut self, now: Instant) -> Option<Key> {
        let (&(deadline, seq), _) = self.entries.iter().next()?;
        if deadline >= now {
            return None;
        }
        self.entries.remove(&(deadline, seq))
    }

    /// Returns the head deadline without removing it.
    pub fn peek_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|&(deadline, _)| deadline)
    }

    /// Returns the number of registered deadlines.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no deadlines are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every registered deadline.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Verifies internal ordering invariants. Debug/test use only.
    pub fn check_invariants(&self) -> Result<(), InvariantError> {
        let mut prev: Option<(Instant, u64)> = None;
        for &entry in self.entries.keys() {
            if let Some(prev) = prev {
                if entry <= prev {
                    return Err(InvariantError::new("deadline index out of order"));
                }
            }
            if entry.1 >= self.next_seq {
                return Err(InvariantError::new("counter ahead of allocator"));
            }
            prev = Some(entry);
        }
        Ok(())
    }
}
