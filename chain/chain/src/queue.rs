//! The bounded add-block queue and the per-block promise pair.

use weft_primitives::{Block, Point};

use crate::error::Error;

/// A block waiting for the worker, with the two promise senders the
/// caller is blocked on. Dropping the senders (queue teardown, fatal
/// error) resolves the caller's receivers with [`Error::DbClosed`].
pub(crate) struct BlockToAdd {
    pub block: Block,
    pub written: oneshot::Sender<bool>,
    pub processed: oneshot::Sender<Point>,
}

/// The two futures handed back by `add_block`.
///
/// `written_to_disk` resolves first: `true` once the block is durable in
/// the volatile store, `false` when it was rejected before persistence.
/// `processed` resolves with the chain tip after chain selection ran for
/// the block.
pub struct AddBlockPromise {
    written: Option<oneshot::Receiver<bool>>,
    processed: Option<oneshot::Receiver<Point>>,
}

impl AddBlockPromise {
    pub(crate) fn new(
        written: oneshot::Receiver<bool>,
        processed: oneshot::Receiver<Point>,
    ) -> Self {
        AddBlockPromise { written: Some(written), processed: Some(processed) }
    }

    /// A promise pair that is already resolved; used for blocks rejected
    /// before they reach the queue.
    pub(crate) fn resolved(written: bool, tip: Point) -> Self {
        let (written_tx, written_rx) = oneshot::channel();
        let (processed_tx, processed_rx) = oneshot::channel();
        let _ = written_tx.send(written);
        let _ = processed_tx.send(tip);
        Self::new(written_rx, processed_rx)
    }

    /// Blocks until the durability promise resolves. Each promise may be
    /// awaited once; later calls return [`Error::DbClosed`].
    pub fn written_to_disk(&mut self) -> Result<bool, Error> {
        let receiver = self.written.take().ok_or(Error::DbClosed)?;
        receiver.recv().map_err(|_| Error::DbClosed)
    }

    /// Blocks until chain selection has run for the block, yielding the
    /// resulting chain tip.
    pub fn processed(&mut self) -> Result<Point, Error> {
        let receiver = self.processed.take().ok_or(Error::DbClosed)?;
        receiver.recv().map_err(|_| Error::DbClosed)
    }
}

pub(crate) fn promise_pair(block: Block) -> (BlockToAdd, AddBlockPromise) {
    let (written_tx, written_rx) = oneshot::channel();
    let (processed_tx, processed_rx) = oneshot::channel();
    (
        BlockToAdd { block, written: written_tx, processed: processed_tx },
        AddBlockPromise::new(written_rx, processed_rx),
    )
}
