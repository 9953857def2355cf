use std::fmt;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::hash::BlockHash;

/// Logical time. Strictly monotonic along a chain but not dense: slots
/// without a block are normal.
pub type Slot = u64;

/// Dense height counter, consecutive from parent to child.
pub type BlockNumber = u64;

/// Index of an immutable-store chunk file. One chunk per epoch.
pub type ChunkIndex = u64;

/// A position on a chain: either the origin (before any block) or a
/// specific block identified by slot and hash.
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum Point {
    Origin,
    Block(Slot, BlockHash),
}

impl Point {
    pub fn block(slot: Slot, hash: BlockHash) -> Self {
        Point::Block(slot, hash)
    }

    pub fn is_origin(&self) -> bool {
        matches!(self, Point::Origin)
    }

    pub fn slot(&self) -> Option<Slot> {
        match self {
            Point::Origin => None,
            Point::Block(slot, _) => Some(*slot),
        }
    }

    pub fn hash(&self) -> Option<BlockHash> {
        match self {
            Point::Origin => None,
            Point::Block(_, hash) => Some(*hash),
        }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Point::Origin => write!(f, "origin"),
            Point::Block(slot, hash) => write!(f, "{hash}@{slot}"),
        }
    }
}

impl fmt::Debug for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Cheap summary of a chain end.
#[derive(
    Copy, Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize, serde::Serialize,
)]
pub struct Tip {
    pub point: Point,
    /// `None` at the origin, where no block exists yet.
    pub block_no: Option<BlockNumber>,
    /// Whether the tip block is an epoch boundary block.
    pub is_boundary: bool,
}

impl Tip {
    pub fn genesis() -> Self {
        Tip { point: Point::Origin, block_no: None, is_boundary: false }
    }

    pub fn slot(&self) -> Option<Slot> {
        self.point.slot()
    }

    pub fn hash(&self) -> Option<BlockHash> {
        self.point.hash()
    }

    /// Block number of the next block extending this tip.
    pub fn next_block_no(&self) -> BlockNumber {
        self.block_no.map_or(0, |n| n + 1)
    }
}
