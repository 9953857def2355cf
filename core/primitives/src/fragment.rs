use std::collections::VecDeque;

use crate::block::BlockHeader;
use crate::hash::BlockHash;
use crate::types::{Point, Tip};

/// An ordered run of headers whose first element links to a designated
/// anchor point. The fragment may be empty, in which case the anchor is
/// also its head.
///
/// Invariants, enforced on every `push`:
/// - the first header's parent link points at the anchor;
/// - adjacent headers have consecutive block numbers;
/// - slots strictly increase, except that an epoch boundary block shares
///   its slot with its ordinary successor.
#[derive(Clone, Debug)]
pub struct AnchoredFragment {
    anchor: Tip,
    headers: VecDeque<BlockHeader>,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FragmentError {
    #[error("header {header} does not link to fragment head {head}")]
    BrokenLink { header: Point, head: Point },
    #[error("header {header} has block number {got}, expected {want}")]
    NonConsecutive { header: Point, got: u64, want: u64 },
    #[error("header {header} at slot {got} does not advance past slot {prev}")]
    SlotNotIncreasing { header: Point, got: u64, prev: u64 },
}

impl AnchoredFragment {
    pub fn new(anchor: Tip) -> Self {
        AnchoredFragment { anchor, headers: VecDeque::new() }
    }

    /// Fragment anchored at genesis with no headers.
    pub fn empty() -> Self {
        Self::new(Tip::genesis())
    }

    pub fn anchor(&self) -> Tip {
        self.anchor
    }

    pub fn anchor_point(&self) -> Point {
        self.anchor.point
    }

    /// The tip of the fragment: the newest header, or the anchor when the
    /// fragment is empty.
    pub fn head(&self) -> Tip {
        self.headers.back().map_or(self.anchor, |h| h.tip())
    }

    pub fn head_point(&self) -> Point {
        self.head().point
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn headers(&self) -> impl DoubleEndedIterator<Item = &BlockHeader> {
        self.headers.iter()
    }

    pub fn get(&self, index: usize) -> Option<&BlockHeader> {
        self.headers.get(index)
    }

    /// Checks whether `header` may extend the fragment, without mutating.
    pub fn check_extends(&self, header: &BlockHeader) -> Result<(), FragmentError> {
        let head = self.head();
        if !header.prev_hash().points_at(&head.point) {
            return Err(FragmentError::BrokenLink { header: header.point(), head: head.point });
        }
        let want = head.block_no.map_or(0, |n| n + 1);
        if header.block_no() != want {
            return Err(FragmentError::NonConsecutive {
                header: header.point(),
                got: header.block_no(),
                want,
            });
        }
        if let Some(prev_slot) = head.slot() {
            // A boundary block's ordinary successor shares its slot.
            let shared = head.is_boundary && !header.is_boundary();
            let advances =
                if shared { header.slot() >= prev_slot } else { header.slot() > prev_slot };
            if !advances {
                return Err(FragmentError::SlotNotIncreasing {
                    header: header.point(),
                    got: header.slot(),
                    prev: prev_slot,
                });
            }
        }
        Ok(())
    }

    pub fn push(&mut self, header: BlockHeader) -> Result<(), FragmentError> {
        self.check_extends(&header)?;
        self.headers.push_back(header);
        Ok(())
    }

    /// Whether the point is the anchor or one of the fragment's headers.
    pub fn contains_point(&self, point: &Point) -> bool {
        self.anchor.point == *point || self.index_of(point).is_some()
    }

    /// Index of the header at `point`, if it is on the fragment.
    pub fn index_of(&self, point: &Point) -> Option<usize> {
        let (slot, hash) = match point {
            Point::Origin => return None,
            Point::Block(slot, hash) => (*slot, *hash),
        };
        // Headers are slot-ordered; scan from the newest end and stop once
        // slots drop below the target.
        self.headers
            .iter()
            .enumerate()
            .rev()
            .take_while(|(_, h)| h.slot() >= slot)
            .find(|(_, h)| h.slot() == slot && h.hash() == hash)
            .map(|(i, _)| i)
    }

    /// Drops every header newer than `point`, leaving `point` as the head.
    /// Returns the dropped headers (oldest first), or `None` when `point`
    /// is on neither the fragment nor its anchor.
    pub fn rollback_to(&mut self, point: &Point) -> Option<Vec<BlockHeader>> {
        if self.anchor.point == *point {
            return Some(self.headers.drain(..).collect());
        }
        let index = self.index_of(point)?;
        Some(self.headers.drain(index + 1..).collect())
    }

    /// Removes the oldest `count` headers and advances the anchor past
    /// them. Returns the removed headers, oldest first.
    pub fn advance_anchor(&mut self, count: usize) -> Vec<BlockHeader> {
        let count = count.min(self.headers.len());
        let removed: Vec<BlockHeader> = self.headers.drain(..count).collect();
        if let Some(newest) = removed.last() {
            self.anchor = newest.tip();
        }
        removed
    }

    /// Headers strictly newer than `point`, oldest first. `None` when
    /// `point` is not on the fragment.
    pub fn headers_after(&self, point: &Point) -> Option<Vec<BlockHeader>> {
        if self.anchor.point == *point {
            return Some(self.headers.iter().cloned().collect());
        }
        let index = self.index_of(point)?;
        Some(self.headers.range(index + 1..).cloned().collect())
    }

    /// The newest point shared with `other`, walking back from our head.
    /// Both fragments must be anchored on the same chain for the result to
    /// be meaningful.
    pub fn intersect(&self, other: &AnchoredFragment) -> Option<Point> {
        std::iter::once(self.head_point())
            .chain(self.headers.iter().rev().skip(1).map(|h| h.point()))
            .chain(std::iter::once(self.anchor.point))
            .find(|p| other.contains_point(p))
    }
}
