//! Readers follow the current chain as it evolves: a stream of roll-
//! forward and roll-backward instructions that always converges on the
//! selected chain.
//!
//! A reader's logical position lives in the shared chain state so the
//! worker can re-anchor it during a fork switch; the handle itself only
//! carries the immutable-store iterator it may have open while catching
//! up through the settled prefix.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use weft_primitives::{BlockHeader, Point};
use weft_store::immutable::{ImmutableStream, StreamError, StreamFrom};
use weft_store::{BlockComponent, ComponentValue, StoreError};

use crate::chain_db::{ChainDbInner, ChainState};
use crate::error::Error;

/// What a reader should send to its consumer next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum RollState {
    /// Tell the consumer to roll back to the point, then continue forward
    /// from it.
    Backward(Point),
    /// Continue forward past the point.
    Forward(Point),
}

/// A reader's shared position. The generation is bumped whenever the
/// worker moves the reader, invalidating any iterator the handle holds.
#[derive(Clone, Debug)]
pub(crate) struct ReaderPos {
    pub state: RollState,
    pub generation: u64,
}

/// One instruction of the reader stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainUpdate {
    RollBackward(Point),
    RollForward(Point, ComponentValue),
}

/// Follows the current chain. Obtained from `ChainDb::new_reader`.
pub struct Reader {
    inner: Arc<ChainDbInner>,
    id: u64,
    component: BlockComponent,
    /// Iterator over the settled prefix, valid for the generation it was
    /// opened under.
    iter: Option<(u64, ImmutableStream)>,
}

impl fmt::Debug for Reader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader").field("id", &self.id).finish_non_exhaustive()
    }
}

enum ImmStep {
    Update(ChainUpdate),
    /// State changed underneath us (fork switch, anchor advance); take
    /// another look.
    Retry,
}

impl Reader {
    pub(crate) fn register(
        inner: Arc<ChainDbInner>,
        component: BlockComponent,
    ) -> Result<Reader, Error> {
        if inner.is_closed() {
            return Err(Error::DbClosed);
        }
        let id = {
            let mut chain = inner.chain.lock();
            let id = chain.next_reader_id;
            chain.next_reader_id += 1;
            chain
                .readers
                .insert(id, ReaderPos { state: RollState::Forward(Point::Origin), generation: 0 });
            id
        };
        Ok(Reader { inner, id, component, iter: None })
    }

    /// The next instruction, or `None` when the reader is caught up with
    /// the current tip.
    pub fn instruction(&mut self) -> Result<Option<ChainUpdate>, Error> {
        loop {
            if self.inner.is_closed() {
                return Err(Error::DbClosed);
            }
            let (state, generation) = {
                let chain = self.inner.chain.lock();
                let pos = chain.readers.get(&self.id).ok_or(Error::DbClosed)?;
                (pos.state.clone(), pos.generation)
            };
            match state {
                RollState::Backward(point) => {
                    let mut chain = self.inner.chain.lock();
                    let pos = chain.readers.get_mut(&self.id).ok_or(Error::DbClosed)?;
                    if pos.generation != generation {
                        continue;
                    }
                    pos.state = RollState::Forward(point);
                    drop(chain);
                    self.iter = None;
                    return Ok(Some(ChainUpdate::RollBackward(point)));
                }
                RollState::Forward(point) => {
                    // On the fragment: the next header is in memory.
                    let on_fragment = {
                        let chain = self.inner.chain.lock();
                        chain.current.headers_after(&point).map(|hs| hs.into_iter().next())
                    };
                    match on_fragment {
                        Some(Some(header)) => {
                            let update = self.materialize(&header)?;
                            if !self.advance(generation, header.point()) {
                                continue;
                            }
                            return Ok(Some(update));
                        }
                        Some(None) => return Ok(None),
                        None => match self.next_from_immutable(generation, point)? {
                            ImmStep::Update(update) => return Ok(Some(update)),
                            ImmStep::Retry => {
                                // Raced with the copy task mid-handover;
                                // don't spin hot while it finishes.
                                std::thread::yield_now();
                                continue;
                            }
                        },
                    }
                }
            }
        }
    }

    /// Like [`Reader::instruction`] but parks until the chain changes
    /// when the reader is caught up.
    pub fn instruction_blocking(&mut self) -> Result<ChainUpdate, Error> {
        loop {
            if let Some(update) = self.instruction()? {
                return Ok(update);
            }
            let mut chain = self.inner.chain.lock();
            if self.inner.is_closed() {
                return Err(Error::DbClosed);
            }
            // Bounded wait: a notification between the instruction above
            // and this park would otherwise be missed forever.
            self.inner.chain_changed.wait_for(&mut chain, Duration::from_millis(100));
        }
    }

    /// Moves the reader to the newest of `points` that is on the current
    /// chain. The next instruction will be a roll-back to that point.
    pub fn forward(&mut self, points: &[Point]) -> Result<Option<Point>, Error> {
        if self.inner.is_closed() {
            return Err(Error::DbClosed);
        }
        for point in points {
            let on_chain = match point {
                Point::Origin => true,
                _ => {
                    let on_fragment = self.inner.chain.lock().current.contains_point(point);
                    on_fragment || self.inner.storage.immutable.contains(point)?
                }
            };
            if on_chain {
                let mut chain = self.inner.chain.lock();
                let pos = chain.readers.get_mut(&self.id).ok_or(Error::DbClosed)?;
                pos.state = RollState::Backward(*point);
                pos.generation += 1;
                drop(chain);
                self.iter = None;
                return Ok(Some(*point));
            }
        }
        Ok(None)
    }

    /// Deregisters the reader. Also runs on drop.
    pub fn close(&mut self) {
        self.iter = None;
        self.inner.chain.lock().readers.remove(&self.id);
    }

    /// Serve the block after `point` out of the immutable store, keeping
    /// the open iterator as long as the reader's generation stands.
    fn next_from_immutable(&mut self, generation: u64, point: Point) -> Result<ImmStep, Error> {
        if self.iter.as_ref().is_some_and(|(g, _)| *g != generation) {
            self.iter = None;
        }
        if self.iter.is_none() {
            let immutable_tip = self.inner.storage.immutable.tip();
            if immutable_tip.point == point || immutable_tip.point.is_origin() {
                // Raced with the copy task; the fragment serves this
                // position now.
                return Ok(ImmStep::Retry);
            }
            let stream = match self.inner.storage.immutable.stream(
                StreamFrom::Exclusive(point),
                immutable_tip.point,
                self.component,
            ) {
                Ok(stream) => stream,
                Err(StreamError::Store(e)) => return Err(e.into()),
                Err(_) => {
                    // The point is not on the settled chain: a fork
                    // switch moved us between state read and now.
                    if self.generation_changed(generation)? {
                        return Ok(ImmStep::Retry);
                    }
                    return Err(Error::Store(StoreError::corruption(
                        self.inner.storage.root(),
                        format!("reader position {point} is on neither store"),
                    )));
                }
            };
            self.iter = Some((generation, stream));
        }

        let (_, stream) = self.iter.as_mut().expect("iterator just ensured");
        match stream.next() {
            Some(Ok((point, value))) => {
                if !self.advance(generation, point) {
                    self.iter = None;
                    return Ok(ImmStep::Retry);
                }
                Ok(ImmStep::Update(ChainUpdate::RollForward(point, value)))
            }
            Some(Err(e)) => Err(e.into()),
            None => {
                // Reached the immutable tip this iterator was opened
                // against; the fragment (or a newer iterator) continues.
                self.iter = None;
                Ok(ImmStep::Retry)
            }
        }
    }

    /// Commits a new forward position unless the worker moved the reader
    /// in the meantime.
    fn advance(&self, generation: u64, point: Point) -> bool {
        let mut chain = self.inner.chain.lock();
        let Some(pos) = chain.readers.get_mut(&self.id) else { return false };
        if pos.generation != generation {
            return false;
        }
        pos.state = RollState::Forward(point);
        true
    }

    fn generation_changed(&self, generation: u64) -> Result<bool, Error> {
        let chain = self.inner.chain.lock();
        let pos = chain.readers.get(&self.id).ok_or(Error::DbClosed)?;
        Ok(pos.generation != generation)
    }

    fn materialize(&self, header: &BlockHeader) -> Result<ChainUpdate, Error> {
        let value = match self.component {
            BlockComponent::Header => ComponentValue::Header(header.clone()),
            component => self
                .inner
                .fetch_component(&header.point(), component)?
                .ok_or_else(|| {
                    Error::Store(StoreError::corruption(
                        self.inner.storage.root(),
                        format!("chain block {} is on neither store", header.point()),
                    ))
                })?,
        };
        Ok(ChainUpdate::RollForward(header.point(), value))
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Worker-side notification: re-anchors every reader whose position was
/// rolled back by a fork switch. Runs under the chain lock inside the
/// adoption transaction.
pub(crate) fn switch_fork(
    chain: &mut ChainState,
    rollback_point: Point,
    dropped_points: &HashSet<Point>,
) {
    for pos in chain.readers.values_mut() {
        let point = match &pos.state {
            RollState::Backward(p) | RollState::Forward(p) => *p,
        };
        if dropped_points.contains(&point) {
            pos.state = RollState::Backward(rollback_point);
            pos.generation += 1;
        }
    }
}
