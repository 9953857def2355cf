use std::cmp::Ordering;
use std::collections::HashMap;

use weft_primitives::{BlockHash, Slot, Tip};

/// The consensus layer's chain order, consulted by chain selection.
pub trait ChainPreference: Send + Sync {
    /// Whether `candidate` is strictly preferable to `current`. A
    /// candidate that merely equals the current chain must not win.
    fn prefer_candidate(&self, current: &Tip, candidate: &Tip) -> bool;

    /// Order in which competing candidates are tried; `Greater` means `a`
    /// is tried first. Ties are broken by the caller (construction order,
    /// then tip hash) so the overall order stays total.
    fn compare_candidates(&self, a: &Tip, b: &Tip) -> Ordering;
}

/// Longest chain wins; equal-length candidates tie.
#[derive(Clone, Copy, Debug, Default)]
pub struct LongestChain;

impl ChainPreference for LongestChain {
    fn prefer_candidate(&self, current: &Tip, candidate: &Tip) -> bool {
        candidate.block_no > current.block_no
    }

    fn compare_candidates(&self, a: &Tip, b: &Tip) -> Ordering {
        a.block_no.cmp(&b.block_no)
    }
}

/// Why a block was judged invalid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvalidBlockReason {
    /// Slot further ahead of the wall clock than the permitted skew.
    InFutureExceedsClockSkew,
    /// The ledger refused to apply the block.
    Ledger(String),
}

#[derive(Clone, Debug)]
pub struct InvalidBlockEntry {
    pub reason: InvalidBlockReason,
    pub slot: Slot,
}

/// Blocks that failed validation, with a fingerprint consumers use to
/// cache their own view cheaply.
#[derive(Debug, Default)]
pub struct InvalidBlocks {
    map: HashMap<BlockHash, InvalidBlockEntry>,
    fingerprint: u64,
}

impl InvalidBlocks {
    /// Records a verdict. Bumps the fingerprint only for new entries, so
    /// it is strictly monotonic in the set's contents.
    pub fn insert(&mut self, hash: BlockHash, reason: InvalidBlockReason, slot: Slot) -> bool {
        let new = self
            .map
            .insert(hash, InvalidBlockEntry { reason, slot })
            .is_none();
        if new {
            self.fingerprint += 1;
        }
        new
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.map.contains_key(hash)
    }

    pub fn get(&self, hash: &BlockHash) -> Option<&InvalidBlockEntry> {
        self.map.get(hash)
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn snapshot(&self) -> WithFingerprint<HashMap<BlockHash, InvalidBlockReason>> {
        WithFingerprint {
            fingerprint: self.fingerprint,
            value: self.map.iter().map(|(h, e)| (*h, e.reason.clone())).collect(),
        }
    }
}

/// A value paired with the fingerprint it was read at.
#[derive(Clone, Debug)]
pub struct WithFingerprint<T> {
    pub fingerprint: u64,
    pub value: T,
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_primitives::Point;

    #[test]
    fn fingerprint_monotonic_and_duplicate_free() {
        let mut invalid = InvalidBlocks::default();
        let a = BlockHash::hash_bytes(b"a");
        assert!(invalid.insert(a, InvalidBlockReason::InFutureExceedsClockSkew, 5));
        assert_eq!(invalid.fingerprint(), 1);
        // Re-inserting the same hash does not bump.
        assert!(!invalid.insert(a, InvalidBlockReason::Ledger("again".into()), 5));
        assert_eq!(invalid.fingerprint(), 1);
        assert!(invalid.insert(
            BlockHash::hash_bytes(b"b"),
            InvalidBlockReason::Ledger("bad".into()),
            6
        ));
        assert_eq!(invalid.fingerprint(), 2);
        assert_eq!(invalid.len(), 2);
    }

    #[test]
    fn longest_chain_prefers_strictly_longer() {
        let preference = LongestChain;
        let short = Tip {
            point: Point::Block(5, BlockHash::hash_bytes(b"s")),
            block_no: Some(4),
            is_boundary: false,
        };
        let long = Tip {
            point: Point::Block(6, BlockHash::hash_bytes(b"l")),
            block_no: Some(5),
            is_boundary: false,
        };
        assert!(preference.prefer_candidate(&short, &long));
        assert!(!preference.prefer_candidate(&long, &short));
        assert!(!preference.prefer_candidate(&short, &short));
        assert!(preference.prefer_candidate(&Tip::genesis(), &short));
        assert_eq!(preference.compare_candidates(&short, &long), Ordering::Less);
    }
}
