//! Vector clocks over feeds.

use std::{collections::btree_map, collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::keys::FeedId;

/// A vector clock: for a set of feeds, the highest consumed sequence number
/// of each.
///
/// Sequence numbers start at zero, so `{feed => 0}` means the first entry of
/// `feed` has been consumed. Absence of a feed means nothing of it has been
/// consumed. Stored entries stamp the writer's current timeframe as their
/// dependencies, which is what gives replicated feeds a causal order.
#[derive(Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Timeframe {
    frames: BTreeMap<FeedId, u64>,
}

impl Timeframe {
    /// The empty timeframe.
    pub fn new() -> Self {
        Self::default()
    }

    /// The highest consumed sequence number for `feed`, if any.
    pub fn get(&self, feed: &FeedId) -> Option<u64> {
        self.frames.get(feed).copied()
    }

    /// Record `seq` as consumed for `feed`.
    ///
    /// Keeps the maximum if a higher sequence number is already recorded, so
    /// applying the same information twice or out of order is harmless.
    pub fn insert(&mut self, feed: FeedId, seq: u64) {
        self.frames
            .entry(feed)
            .and_modify(|s| *s = (*s).max(seq))
            .or_insert(seq);
    }

    /// Merge `other` into `self`, keeping the pointwise maximum.
    ///
    /// Commutative, associative and idempotent.
    pub fn merge(&mut self, other: &Self) {
        for (feed, seq) in other.iter() {
            self.insert(*feed, *seq);
        }
    }

    /// The frames of `self` that `current` has not reached: feeds missing
    /// from `current` entirely or recorded with a lower sequence number.
    ///
    /// Empty iff every dependency in `self` is satisfied by `current`.
    pub fn unsatisfied(&self, current: &Self) -> Timeframe {
        let frames = self
            .frames
            .iter()
            .filter(|(feed, seq)| match current.get(feed) {
                Some(cur) => cur < **seq,
                None => true,
            })
            .map(|(feed, seq)| (*feed, *seq))
            .collect();
        Self { frames }
    }

    /// Number of feeds with a recorded frame.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether no frames are recorded.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Iterate over `(feed, seq)` frames in feed order.
    pub fn iter(&self) -> impl Iterator<Item = (&FeedId, &u64)> {
        self.frames.iter()
    }
}

impl FromIterator<(FeedId, u64)> for Timeframe {
    fn from_iter<I: IntoIterator<Item = (FeedId, u64)>>(iter: I) -> Self {
        let mut tf = Self::new();
        for (feed, seq) in iter {
            tf.insert(feed, seq);
        }
        tf
    }
}

impl IntoIterator for Timeframe {
    type Item = (FeedId, u64);
    type IntoIter = btree_map::IntoIter<FeedId, u64>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.into_iter()
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        let mut first = true;
        for (feed, seq) in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{} => {}", feed.fmt_short(), seq)?;
            first = false;
        }
        write!(f, "]")
    }
}

impl fmt::Debug for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timeframe{self}")
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn feed(n: u8) -> FeedId {
        FeedId::from_bytes([n; 32])
    }

    fn arb_timeframe() -> impl Strategy<Value = Timeframe> {
        proptest::collection::btree_map(any::<u8>().prop_map(feed), 0u64..100, 0..6)
            .prop_map(|frames| frames.into_iter().collect())
    }

    #[test]
    fn test_merge_keeps_pointwise_max() {
        let mut a: Timeframe = [(feed(1), 3), (feed(2), 5)].into_iter().collect();
        let b: Timeframe = [(feed(1), 7)].into_iter().collect();
        a.merge(&b);
        let expected: Timeframe = [(feed(1), 7), (feed(2), 5)].into_iter().collect();
        assert_eq!(a, expected);
    }

    #[test]
    fn test_unsatisfied() {
        let required: Timeframe = [(feed(1), 3), (feed(2), 2)].into_iter().collect();
        let current: Timeframe = [(feed(1), 5)].into_iter().collect();
        let missing = required.unsatisfied(&current);
        let expected: Timeframe = [(feed(2), 2)].into_iter().collect();
        assert_eq!(missing, expected);
    }

    #[test]
    fn test_empty_dependencies_always_satisfied() {
        let required = Timeframe::new();
        assert!(required.unsatisfied(&Timeframe::new()).is_empty());
        let current: Timeframe = [(feed(1), 0)].into_iter().collect();
        assert!(required.unsatisfied(&current).is_empty());
    }

    #[test]
    fn test_seq_zero_is_a_real_frame() {
        // {feed => 0} means the first entry was consumed, which is different
        // from the feed being absent.
        let required: Timeframe = [(feed(1), 0)].into_iter().collect();
        assert_eq!(required.unsatisfied(&Timeframe::new()), required);
        let current: Timeframe = [(feed(1), 0)].into_iter().collect();
        assert!(required.unsatisfied(&current).is_empty());
    }

    #[test]
    fn test_insert_never_regresses() {
        let mut tf = Timeframe::new();
        tf.insert(feed(1), 9);
        tf.insert(feed(1), 4);
        assert_eq!(tf.get(&feed(1)), Some(9));
    }

    #[test]
    fn test_display() {
        let tf: Timeframe = [(feed(0xab), 4)].into_iter().collect();
        assert_eq!(tf.to_string(), "[ababababab => 4]");
        assert_eq!(Timeframe::new().to_string(), "[]");
    }

    proptest! {
        #[test]
        fn prop_merge_commutative(a in arb_timeframe(), b in arb_timeframe()) {
            let mut ab = a.clone();
            ab.merge(&b);
            let mut ba = b.clone();
            ba.merge(&a);
            prop_assert_eq!(ab, ba);
        }

        #[test]
        fn prop_merge_idempotent(a in arb_timeframe()) {
            let mut aa = a.clone();
            aa.merge(&a);
            prop_assert_eq!(aa, a);
        }

        #[test]
        fn prop_merge_associative(
            a in arb_timeframe(),
            b in arb_timeframe(),
            c in arb_timeframe(),
        ) {
            let mut ab_c = a.clone();
            ab_c.merge(&b);
            ab_c.merge(&c);
            let mut bc = b.clone();
            bc.merge(&c);
            let mut a_bc = a.clone();
            a_bc.merge(&bc);
            prop_assert_eq!(ab_c, a_bc);
        }

        #[test]
        fn prop_merge_satisfies_both_inputs(a in arb_timeframe(), b in arb_timeframe()) {
            let mut merged = a.clone();
            merged.merge(&b);
            prop_assert!(a.unsatisfied(&merged).is_empty());
            prop_assert!(b.unsatisfied(&merged).is_empty());
        }

        #[test]
        fn prop_unsatisfied_frames_exceed_current(
            a in arb_timeframe(),
            b in arb_timeframe(),
        ) {
            for (feed, seq) in a.unsatisfied(&b).iter() {
                prop_assert!(b.get(feed).map_or(true, |cur| cur < *seq));
            }
        }

        #[test]
        fn prop_postcard_roundtrip(a in arb_timeframe()) {
            let bytes = postcard::to_allocvec(&a).unwrap();
            let back: Timeframe = postcard::from_bytes(&bytes).unwrap();
            prop_assert_eq!(a, back);
        }
    }
}
