//! Streaming over a range of the immutable log.

use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::path::PathBuf;

use weft_primitives::types::ChunkIndex;
use weft_primitives::{BlockHash, Point, Slot};

use crate::{BlockComponent, ComponentValue, StoreError, io_err};

use super::index::{self, SecondaryEntry};
use super::{ChunkLayout, ImmutableDb, chunk_entries_on_disk, chunk_file, component_from_bytes};

/// Start of a stream range.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamFrom {
    /// From the oldest stored block.
    Start,
    Inclusive(Point),
    /// From the successor of the point; used when replaying on top of a
    /// known state.
    Exclusive(Point),
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("stream range is empty")]
    EmptyRange,
    #[error("block {0} is not in the immutable store")]
    MissingBlock(Point),
    #[error("stream start predates the oldest stored block")]
    ForkTooOld,
}

/// Pull-based iterator yielding `(point, component)` in chain order until
/// the inclusive end point.
pub struct ImmutableStream {
    dir: PathBuf,
    layout: ChunkLayout,
    component: BlockComponent,
    /// Chunks not yet loaded, ascending.
    chunks: VecDeque<ChunkIndex>,
    /// Entries remaining in the chunk currently being streamed.
    pending: VecDeque<(Slot, SecondaryEntry)>,
    current: Option<(ChunkIndex, File)>,
    end_hash: BlockHash,
    done: bool,
}

impl fmt::Debug for ImmutableStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImmutableStream").field("dir", &self.dir).finish_non_exhaustive()
    }
}

pub(super) fn stream(
    db: &ImmutableDb,
    from: StreamFrom,
    to: Point,
    component: BlockComponent,
) -> Result<ImmutableStream, StreamError> {
    let Point::Block(to_slot, to_hash) = to else { return Err(StreamError::EmptyRange) };
    if db.locate(&to)?.is_none() {
        return Err(StreamError::MissingBlock(to));
    }

    let mut stream = ImmutableStream {
        dir: db.dir().to_path_buf(),
        layout: db.layout(),
        component,
        chunks: db.chunk_list().into(),
        pending: VecDeque::new(),
        current: None,
        end_hash: to_hash,
        done: false,
    };

    let (start, exclusive) = match from {
        StreamFrom::Start | StreamFrom::Inclusive(Point::Origin) => (None, false),
        StreamFrom::Exclusive(Point::Origin) => (None, false),
        StreamFrom::Inclusive(point) => (Some(point), false),
        StreamFrom::Exclusive(point) => (Some(point), true),
    };

    if let Some(point) = start {
        let slot = point.slot().expect("origin handled above");
        let Some(located) = db.locate(&point)? else {
            let earliest = db.earliest_slot()?;
            return match earliest {
                Some(earliest) if slot >= earliest => Err(StreamError::MissingBlock(point)),
                _ => Err(StreamError::ForkTooOld),
            };
        };
        if slot > to_slot {
            return Err(StreamError::EmptyRange);
        }
        if point == to && exclusive {
            stream.done = true;
            return Ok(stream);
        }
        // Position the stream on the chunk holding the start point and
        // drop everything before it.
        while let Some(&chunk) = stream.chunks.front() {
            if chunk == located.chunk {
                break;
            }
            stream.chunks.pop_front();
        }
        stream.load_next_chunk()?;
        let hash = point.hash().expect("origin handled above");
        while let Some((_, entry)) = stream.pending.front() {
            if entry.hash == *hash.as_bytes() {
                break;
            }
            stream.pending.pop_front();
        }
        if stream.pending.is_empty() {
            return Err(StreamError::Store(StoreError::corruption(
                chunk_file(&stream.dir, located.chunk),
                "located block missing from its chunk index",
            )));
        }
        if exclusive {
            stream.pending.pop_front();
        }
    }
    Ok(stream)
}

impl ImmutableStream {
    fn load_next_chunk(&mut self) -> Result<(), StoreError> {
        let Some(chunk) = self.chunks.pop_front() else {
            self.done = true;
            return Ok(());
        };
        self.pending = chunk_entries_on_disk(&self.dir, self.layout, chunk)?.into();
        let path = chunk_file(&self.dir, chunk);
        let file = File::open(&path).map_err(|e| io_err(&path, e))?;
        self.current = Some((chunk, file));
        Ok(())
    }

    fn read_next(&mut self) -> Result<Option<(Point, ComponentValue)>, StoreError> {
        loop {
            if self.done {
                return Ok(None);
            }
            let Some((slot, entry)) = self.pending.pop_front() else {
                self.load_next_chunk()?;
                continue;
            };
            let (chunk, file) =
                self.current.as_mut().expect("current chunk set while entries pending");
            let path = chunk_file(&self.dir, *chunk);
            let bytes = index::read_frame_at(file, entry.offset)
                .map_err(|e| io_err(&path, e))?
                .ok_or_else(|| {
                    StoreError::corruption(&path, "indexed frame extends past end of chunk")
                })?;
            let value = component_from_bytes(&path, &entry, bytes, self.component)?;
            if entry.hash == *self.end_hash.as_bytes() {
                self.done = true;
            }
            return Ok(Some((Point::Block(slot, BlockHash(entry.hash)), value)));
        }
    }
}

impl Iterator for ImmutableStream {
    type Item = Result<(Point, ComponentValue), StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ImmutableValidation;
    use assert_matches::assert_matches;
    use weft_primitives::Tip;
    use weft_primitives::test_utils::{TestBlockBuilder, build_chain_on};

    fn db_with_chain(dir: &std::path::Path, n: usize) -> (ImmutableDb, Vec<weft_primitives::Block>) {
        let db = ImmutableDb::open(
            dir,
            ChunkLayout { slots_per_chunk: 10 },
            ImmutableValidation::ValidateAllChunks,
        )
        .unwrap();
        let blocks = build_chain_on(&Tip::genesis(), n);
        for block in &blocks {
            db.append(block).unwrap();
        }
        db.sync().unwrap();
        (db, blocks)
    }

    #[test]
    fn stream_whole_range_across_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let (db, blocks) = db_with_chain(dir.path(), 25);
        let items: Vec<_> = db
            .stream(StreamFrom::Start, blocks[24].point(), BlockComponent::Block)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(items.len(), 25);
        for (item, block) in items.iter().zip(&blocks) {
            assert_eq!(item.0, block.point());
            assert_eq!(item.1, ComponentValue::Block(block.clone()));
        }
    }

    #[test]
    fn stream_interior_range_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        let (db, blocks) = db_with_chain(dir.path(), 12);
        let items: Vec<_> = db
            .stream(
                StreamFrom::Inclusive(blocks[3].point()),
                blocks[7].point(),
                BlockComponent::Header,
            )
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(items.len(), 5);
        assert_eq!(items[0].0, blocks[3].point());
        assert_eq!(items[4].0, blocks[7].point());
    }

    #[test]
    fn stream_exclusive_start_for_replay() {
        let dir = tempfile::tempdir().unwrap();
        let (db, blocks) = db_with_chain(dir.path(), 6);
        let items: Vec<_> = db
            .stream(
                StreamFrom::Exclusive(blocks[1].point()),
                blocks[5].point(),
                BlockComponent::Block,
            )
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(items.first().unwrap().0, blocks[2].point());
        assert_eq!(items.len(), 4);

        // Replay from the tip itself yields nothing.
        let empty: Vec<_> = db
            .stream(
                StreamFrom::Exclusive(blocks[5].point()),
                blocks[5].point(),
                BlockComponent::Block,
            )
            .unwrap()
            .collect();
        assert!(empty.is_empty());
    }

    #[test]
    fn stream_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (db, blocks) = db_with_chain(dir.path(), 4);

        let unknown = TestBlockBuilder::new(blocks[3].header()).build();
        assert_matches!(
            db.stream(StreamFrom::Start, unknown.point(), BlockComponent::Block),
            Err(StreamError::MissingBlock(_))
        );
        assert_matches!(
            db.stream(StreamFrom::Start, Point::Origin, BlockComponent::Block),
            Err(StreamError::EmptyRange)
        );
        assert_matches!(
            db.stream(
                StreamFrom::Inclusive(blocks[3].point()),
                blocks[1].point(),
                BlockComponent::Block
            ),
            Err(StreamError::EmptyRange)
        );
        // A hash that was never stored, sitting at a slot before the
        // oldest block.
        let ancient = Point::Block(0, BlockHash::hash_bytes(b"ancient"));
        assert_matches!(
            db.stream(StreamFrom::Inclusive(ancient), blocks[3].point(), BlockComponent::Block),
            Err(StreamError::ForkTooOld)
        );
        // Same slot range as stored blocks but a foreign hash.
        let foreign = Point::Block(blocks[2].header().slot(), BlockHash::hash_bytes(b"foreign"));
        assert_matches!(
            db.stream(StreamFrom::Inclusive(foreign), blocks[3].point(), BlockComponent::Block),
            Err(StreamError::MissingBlock(_))
        );
    }
}
