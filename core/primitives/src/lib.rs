//! Core types shared by every crate of the node: hashes, points, blocks,
//! headers and anchored chain fragments.

pub mod block;
pub mod clock;
pub mod fragment;
pub mod hash;
pub mod test_utils;
pub mod types;

pub use block::{Block, BlockDecodeError, BlockHeader, PrevHash};
pub use clock::{Clock, FakeClock, SlotClock};
pub use fragment::{AnchoredFragment, FragmentError};
pub use hash::BlockHash;
pub use types::{BlockNumber, Point, Slot, Tip};
