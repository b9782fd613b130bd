//! Canonical cache keys.
//!
//! Callers identify memoized computations with arbitrary value trees:
//! scalars, sequences, tuples and maps, nested freely. Before a key touches
//! a backing store it is normalized into a canonical form so that two keys
//! that are equal by value hash and compare identically regardless of how
//! they were built.
//!
//! ## Normalization Rules
//!
//! - Maps become pair lists sorted by normalized key. The `Map` variant
//!   itself is the sentinel that keeps a normalized mapping distinct from a
//!   sequence of pairs, so `{a: 1}` and `[(a, 1)]` never collide.
//! - Sequences and tuples normalize their children elementwise. Tuples keep
//!   their arity; conversions are provided up to arity 4 and wider
//!   composites are built as sequences.
//! - Scalars pass through unchanged.
//!
//! Normalization is idempotent: `k.normalize().normalize() == k.normalize()`.
//!
//! ## Example
//!
//! ```
//! use memokit::key::Key;
//!
//! let a = Key::Map(vec![("b".into(), 2.into()), ("a".into(), 1.into())]);
//! let b = Key::Map(vec![("a".into(), 1.into()), ("b".into(), 2.into())]);
//! assert_eq!(a.normalize(), b.normalize());
//! ```

/// An owned, immutable key value tree.
///
/// Derives `Ord` and `Hash` so canonical keys are usable both in hash
/// tables and in ordered indexes (the expiration index keys on deadlines
/// but stores `Key` values).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    /// The unit key.
    Unit,
    /// A boolean scalar.
    Bool(bool),
    /// A signed integer scalar.
    Int(i64),
    /// A UTF-8 string scalar.
    Str(String),
    /// An opaque byte string.
    Bytes(Vec<u8>),
    /// An ordered sequence of keys.
    Seq(Vec<Key>),
    /// A fixed-arity composite.
    Tuple(Vec<Key>),
    /// A mapping from keys to keys. Canonical form is sorted by key.
    Map(Vec<(Key, Key)>),
}

impl Key {
    /// Returns the canonical form of this key.
    ///
    /// Scalars are returned as-is. Composites rebuild themselves with
    /// normalized children; maps additionally sort their pairs by the
    /// normalized key (the sort is stable, so duplicate keys keep their
    /// original relative order).
    pub fn normalize(self) -> Key {
        match self {
            Key::Unit | Key::Bool(_) | Key::Int(_) | Key::Str(_) | Key::Bytes(_) => self,
            Key::Seq(items) => Key::Seq(items.into_iter().map(Key::normalize).collect()),
            Key::Tuple(items) => Key::Tuple(items.into_iter().map(Key::normalize).collect()),
            Key::Map(pairs) => {
                let mut pairs: Vec<(Key, Key)> = pairs
                    .into_iter()
                    .map(|(k, v)| (k.normalize(), v.normalize()))
                    .collect();
                pairs.sort_by(|(a, _), (b, _)| a.cmp(b));
                Key::Map(pairs)
            },
        }
    }

    /// Builds a byte-string key.
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Key {
        Key::Bytes(bytes.into())
    }

    /// Builds a sequence key from anything convertible to keys.
    pub fn seq<I, T>(items: I) -> Key
    where
        I: IntoIterator<Item = T>,
        T: Into<Key>,
    {
        Key::Seq(items.into_iter().map(Into::into).collect())
    }

    /// Estimates the memory footprint of this key in bytes.
    ///
    /// Used by the byte-threshold accounting in the eviction strategy. The
    /// estimate counts one node-sized header per tree node plus the heap
    /// payload of strings, byte strings, and child vectors.
    pub fn weight(&self) -> usize {
        const NODE: usize = std::mem::size_of::<Key>();
        match self {
            Key::Unit | Key::Bool(_) | Key::Int(_) => NODE,
            Key::Str(s) => NODE + s.len(),
            Key::Bytes(b) => NODE + b.len(),
            Key::Seq(items) | Key::Tuple(items) => {
                NODE + items.iter().map(Key::weight).sum::<usize>()
            },
            Key::Map(pairs) => {
                NODE + pairs
                    .iter()
                    .map(|(k, v)| k.weight() + v.weight())
                    .sum::<usize>()
            },
        }
    }
}

// =============================================================================
// Conversions
// =============================================================================

impl From<()> for Key {
    fn from(_: ()) -> Key {
        Key::Unit
    }
}

impl From<bool> for Key {
    fn from(value: bool) -> Key {
        Key::Bool(value)
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Key {
        Key::Int(value)
    }
}

impl From<i32> for Key {
    fn from(value: i32) -> Key {
        Key::Int(i64::from(value))
    }
}

impl From<u32> for Key {
    fn from(value: u32) -> Key {
        Key::Int(i64::from(value))
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Key {
        Key::Str(value.to_owned())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Key {
        Key::Str(value)
    }
}

impl From<Vec<Key>> for Key {
    fn from(items: Vec<Key>) -> Key {
        Key::Seq(items)
    }
}

impl<A, B> From<(A, B)> for Key
where
    A: Into<Key>,
    B: Into<Key>,
{
    fn from((a, b): (A, B)) -> Key {
        Key::Tuple(vec![a.into(), b.into()])
    }
}

impl<A, B, C> From<(A, B, C)> for Key
where
    A: Into<Key>,
    B: Into<Key>,
    C: Into<Key>,
{
    fn from((a, b, c): (A, B, C)) -> Key {
        Key::Tuple(vec![a.into(), b.into(), c.into()])
    }
}

impl<A, B, C, D> From<(A, B, C, D)> for Key
where
    A: Into<Key>,
    B: Into<Key>,
    C: Into<Key>,
    D: Into<Key>,
{
    fn from((a, b, c, d): (A, B, C, D)) -> Key {
        Key::Tuple(vec![a.into(), b.into(), c.into(), d.into()])
    }
}

// =============================================================================
// Tests
// =============================================================================


#[cfg(test)]
mod property_tests {
    use proptest::prelude::*;

    use super::*;

    fn arb_key() -> impl Strategy<Value = Key> {
        let scalar = prop_oneof![
            Just(Key::Unit),
            any::<bool>().prop_map(Key::Bool),
            any::<i64>().prop_map(Key::Int),
            "[a-z]{0,8}".prop_map(Key::Str),
            prop::collection::vec(any::<u8>(), 0..8).prop_map(Key::Bytes),
        ];
        scalar.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Key::Seq),
                prop::collection::vec(inner.clone(), 0..4).prop_map(Key::Tuple),
                prop::collection::vec((inner.clone(), inner), 0..4).prop_map(Key::Map),
            ]
        })
    }

    proptest! {
        /// Property: Normalizing twice equals normalizing once
        #[cfg_attr(miri, ignore)]
        #[test]
        fn prop_normalize_is_idempotent(key in arb_key()) {
            let once = key.normalize();
            prop_assert_eq!(once.clone().normalize(), once);
        }

        /// Property: Map pair order never changes the canonical form
        #[cfg_attr(miri, ignore)]
        #[test]
        fn prop_map_order_is_canonicalized(
            pairs in prop::collection::vec((arb_key(), arb_key()), 0..6)
        ) {
            // Reversal is only order-insensitive when the map keys are
            // distinct; duplicates keep their relative order by design.
            let mut seen = std::collections::HashSet::new();
            prop_assume!(pairs.iter().all(|(k, _)| seen.insert(k.clone().normalize())));

            let forward = Key::Map(pairs.clone()).normalize();
            let mut reversed = pairs;
            reversed.reverse();
            let backward = Key::Map(reversed).normalize();
            prop_assert_eq!(forward, backward);
        }

        /// Property: Normalization preserves the weight estimate
        #[cfg_attr(miri, ignore)]
        #[test]
        fn prop_normalize_preserves_weight(key in arb_key()) {
            let weight = key.weight();
            prop_assert_eq!(key.normalize().weight(), weight);
        }
    }
}
