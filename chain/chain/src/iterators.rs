//! Range iterators over a fixed `[from, to]` span of the chain,
//! independent of chain evolution.
//!
//! At creation the range is classified against the two stores: entirely
//! settled, entirely in the volatile pool, or spanning the boundary
//! (settled part first). While streaming, a volatile block that was
//! garbage-collected mid-iteration is transparently re-read from the
//! immutable store if the copy task settled it; if it is simply gone the
//! iterator ends with [`IteratorError::BlockGcedFromVolDb`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use weft_primitives::{BlockHash, Point};
use weft_store::immutable::{ImmutableStream, StreamError, StreamFrom};
use weft_store::{BlockComponent, ComponentValue, StoreError};

use crate::chain_db::{ChainDbInner, component_of_block};
use crate::error::Error;

#[derive(Debug, thiserror::Error)]
pub enum IteratorError {
    /// The block left the volatile pool before the iterator reached it
    /// and was not copied to the immutable store (it lost chain
    /// selection). Terminal.
    #[error("block {0} was garbage collected from the volatile store")]
    BlockGcedFromVolDb(BlockHash),

    #[error("chain database is closed")]
    Closed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Pull-based iterator over a fixed range; see the module docs.
pub struct ChainIterator {
    inner: Arc<ChainDbInner>,
    component: BlockComponent,
    /// The settled part of the range, streamed first.
    stream: Option<ImmutableStream>,
    /// When the range crosses into the volatile pool, the hash at which
    /// the settled part ends.
    stop_after: Option<BlockHash>,
    /// Points served from the volatile pool, ascending.
    volatile_points: VecDeque<Point>,
    done: bool,
}

impl fmt::Debug for ChainIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainIterator").finish_non_exhaustive()
    }
}

pub(crate) fn stream(
    inner: Arc<ChainDbInner>,
    from: Point,
    to: Point,
    component: BlockComponent,
) -> Result<ChainIterator, Error> {
    if inner.is_closed() {
        return Err(Error::DbClosed);
    }
    if let (Some(from_slot), Some(to_slot)) = (from.slot(), to.slot()) {
        if from_slot > to_slot {
            return Err(Error::InvalidIteratorRange { from, to });
        }
    }
    let Point::Block(to_slot, to_hash) = to else {
        return Err(Error::InvalidIteratorRange { from, to });
    };

    // `to` in the volatile pool: walk parent links back towards `from`,
    // collecting the volatile stretch of the range.
    if let Some(to_header) = inner.storage.volatile.get_header(&to_hash) {
        if to_header.slot() != to_slot {
            return Err(Error::UnknownRangeRequested(to));
        }
        let mut points: Vec<Point> = Vec::new();
        let mut cursor = to_header;
        loop {
            points.push(cursor.point());
            if cursor.point() == from {
                // Entirely volatile.
                points.reverse();
                return Ok(ChainIterator {
                    inner,
                    component,
                    stream: None,
                    stop_after: None,
                    volatile_points: points.into(),
                    done: false,
                });
            }
            match cursor.prev_hash().hash() {
                None => {
                    // Walked back to genesis without meeting `from`.
                    if from.is_origin() {
                        points.reverse();
                        return Ok(ChainIterator {
                            inner,
                            component,
                            stream: None,
                            stop_after: None,
                            volatile_points: points.into(),
                            done: false,
                        });
                    }
                    return Err(Error::UnknownRangeRequested(from));
                }
                Some(parent) => match inner.storage.volatile.get_header(&parent) {
                    Some(header) => cursor = header,
                    None => {
                        // The range crosses into the settled store:
                        // stream `[from ..]` from there and stop once the
                        // parent has been served.
                        points.reverse();
                        let stream = open_immutable_part(&inner, from, component)?;
                        return Ok(ChainIterator {
                            inner,
                            component,
                            stream: Some(stream),
                            stop_after: Some(parent),
                            volatile_points: points.into(),
                            done: false,
                        });
                    }
                },
            }
        }
    }

    // Otherwise the whole range must be settled.
    let stream = match inner.storage.immutable.stream(from_bound(from), to, component) {
        Ok(stream) => stream,
        Err(StreamError::Store(e)) => return Err(e.into()),
        Err(StreamError::EmptyRange) => return Err(Error::InvalidIteratorRange { from, to }),
        Err(StreamError::MissingBlock(point)) => return Err(Error::UnknownRangeRequested(point)),
        Err(StreamError::ForkTooOld) => return Err(Error::UnknownRangeRequested(from)),
    };
    Ok(ChainIterator {
        inner,
        component,
        stream: Some(stream),
        stop_after: None,
        volatile_points: VecDeque::new(),
        done: false,
    })
}

fn from_bound(from: Point) -> StreamFrom {
    if from.is_origin() { StreamFrom::Start } else { StreamFrom::Inclusive(from) }
}

/// The settled prefix of a boundary-crossing range: from `from` up to the
/// immutable tip; the caller stops it early at the boundary hash.
fn open_immutable_part(
    inner: &ChainDbInner,
    from: Point,
    component: BlockComponent,
) -> Result<ImmutableStream, Error> {
    let tip = inner.storage.immutable.tip();
    if tip.point.is_origin() {
        return Err(Error::UnknownRangeRequested(from));
    }
    match inner.storage.immutable.stream(from_bound(from), tip.point, component) {
        Ok(stream) => Ok(stream),
        Err(StreamError::Store(e)) => Err(e.into()),
        Err(_) => Err(Error::UnknownRangeRequested(from)),
    }
}

impl ChainIterator {
    fn read_next(&mut self) -> Option<Result<(Point, ComponentValue), IteratorError>> {
        if self.done {
            return None;
        }
        if self.inner.is_closed() {
            self.done = true;
            return Some(Err(IteratorError::Closed));
        }

        if let Some(stream) = self.stream.as_mut() {
            match stream.next() {
                Some(Ok((point, value))) => {
                    if self.stop_after.is_some_and(|stop| point.hash() == Some(stop)) {
                        self.stream = None;
                    }
                    return Some(Ok((point, value)));
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
                None => {
                    if let Some(stop) = self.stop_after.take() {
                        // The boundary block never appeared in the settled
                        // store: the volatile prefix it anchored is gone.
                        self.done = true;
                        return Some(Err(IteratorError::BlockGcedFromVolDb(stop)));
                    }
                    self.stream = None;
                }
            }
        }

        let point = self.volatile_points.pop_front()?;
        let Point::Block(_, hash) = point else {
            self.done = true;
            return None;
        };
        match self.inner.storage.volatile.get(&hash) {
            Ok(Some(block)) => Some(Ok((point, component_of_block(&block, self.component)))),
            Ok(None) => {
                // Collected mid-stream; transparently switch source if the
                // copy task settled the block in the meantime.
                match self.inner.storage.immutable.get_component(&point, self.component) {
                    Ok(Some(value)) => {
                        tracing::debug!(target: "chain", block = %point, "BlockWasCopiedToImmDB: switching iterator source");
                        Some(Ok((point, value)))
                    }
                    Ok(None) => {
                        self.done = true;
                        Some(Err(IteratorError::BlockGcedFromVolDb(hash)))
                    }
                    Err(e) => {
                        self.done = true;
                        Some(Err(e.into()))
                    }
                }
            }
            Err(e) => {
                self.done = true;
                Some(Err(e.into()))
            }
        }
    }
}

impl Iterator for ChainIterator {
    type Item = Result<(Point, ComponentValue), IteratorError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next()
    }
}
