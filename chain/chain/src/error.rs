use weft_primitives::Point;
use weft_store::{StoreError, StoreOpenerError};

/// Errors surfaced by the chain database handle.
///
/// User errors ([`Error::InvalidIteratorRange`],
/// [`Error::UnknownRangeRequested`], [`Error::Config`]) are returned as
/// values and leave the database open. [`Error::Store`] means the
/// database detected corruption or lost its disk: the handle closes and
/// the node must restart with full validation. [`Error::DbClosed`] is
/// returned by every operation after that, or after an explicit close.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("chain database is closed")]
    DbClosed,

    #[error("invalid iterator range from {from} to {to}")]
    InvalidIteratorRange { from: Point, to: Point },

    #[error("requested range bound {0} is not in the database")]
    UnknownRangeRequested(Point),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Opener(#[from] StoreOpenerError),
}
