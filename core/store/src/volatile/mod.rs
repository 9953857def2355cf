//! Pool of recently received blocks that are not yet known to be either
//! immutable or garbage: current-chain extensions, competing forks and
//! not-yet-judged future blocks.
//!
//! Blocks live in bounded segment files on disk; headers and lookup
//! indexes (by hash, by parent, by slot) are kept in memory. A segment
//! file is deleted once every block in it has been garbage-collected.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use weft_primitives::block::PrevHash;
use weft_primitives::{Block, BlockHash, BlockHeader, Point, Slot};

use crate::{StoreError, VolatileValidation, io_err, metrics};

/// Frames mirror the immutable chunk format: little-endian u32 length
/// followed by the serialized block.
const FRAME_PREFIX_SIZE: u64 = 4;

fn segment_file(dir: &Path, segment: u64) -> PathBuf {
    dir.join(format!("blocks-{segment}.dat"))
}

/// The recent-block pool.
pub struct VolatileDb {
    dir: PathBuf,
    max_blocks_per_file: u32,
    state: Mutex<VolState>,
}

struct VolState {
    index: HashMap<BlockHash, StoredBlock>,
    by_prev: HashMap<PrevHash, HashSet<BlockHash>>,
    by_slot: BTreeMap<Slot, HashSet<BlockHash>>,
    /// Live (not yet collected) blocks per segment, including empty
    /// segments awaiting deletion of their file.
    segments: BTreeMap<u64, u32>,
    writer: SegmentWriter,
}

#[derive(Clone)]
struct StoredBlock {
    segment: u64,
    offset: u64,
    header: BlockHeader,
}

struct SegmentWriter {
    segment: u64,
    file: File,
    blocks: u32,
    len: u64,
}

impl VolatileDb {
    /// Opens the pool, re-indexing every segment file. Torn trailing
    /// writes are truncated away; with [`VolatileValidation::ValidateAll`]
    /// each block's body is verified against its header.
    pub fn open(
        dir: &Path,
        max_blocks_per_file: u32,
        validation: VolatileValidation,
    ) -> Result<Self, StoreError> {
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

        let mut index = HashMap::new();
        let mut by_prev: HashMap<PrevHash, HashSet<BlockHash>> = HashMap::new();
        let mut by_slot: BTreeMap<Slot, HashSet<BlockHash>> = BTreeMap::new();
        let mut segments = BTreeMap::new();

        let mut ids = scan_segments(dir)?;
        ids.sort_unstable();
        for segment in ids {
            let blocks = recover_segment(dir, segment, validation)?;
            if blocks.is_empty() {
                fs::remove_file(segment_file(dir, segment))
                    .map_err(|e| io_err(&segment_file(dir, segment), e))?;
                continue;
            }
            let mut live = 0u32;
            for (offset, header) in blocks {
                let hash = header.hash();
                if index.contains_key(&hash) {
                    tracing::warn!(target: "store", block = %hash, segment, "duplicate block in pool; ignoring");
                    continue;
                }
                by_prev.entry(header.prev_hash()).or_default().insert(hash);
                by_slot.entry(header.slot()).or_default().insert(hash);
                index.insert(hash, StoredBlock { segment, offset, header });
                live += 1;
            }
            segments.insert(segment, live);
        }

        // Always start a fresh segment; recovery of a partly written one
        // already happened above.
        let next = segments.keys().next_back().map_or(0, |s| s + 1);
        let writer = open_writer(dir, next)?;
        segments.insert(next, 0);

        metrics::VOLATILE_BLOCKS.set(index.len() as i64);
        metrics::VOLATILE_SEGMENTS.set(segments.len() as i64);
        tracing::info!(
            target: "store",
            blocks = index.len(),
            segments = segments.len(),
            "opened volatile store",
        );
        Ok(VolatileDb {
            dir: dir.to_path_buf(),
            max_blocks_per_file,
            state: Mutex::new(VolState { index, by_prev, by_slot, segments, writer }),
        })
    }

    /// Stores a block. Idempotent: returns `Ok(false)` without touching
    /// disk when the block is already in the pool.
    pub fn put(&self, block: &Block) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        let hash = block.hash();
        if state.index.contains_key(&hash) {
            tracing::debug!(target: "store", block = %hash, "block already in pool");
            return Ok(false);
        }

        let bytes = block.to_bytes();
        let path = segment_file(&self.dir, state.writer.segment);
        let len = u32::try_from(bytes.len()).map_err(|_| {
            StoreError::corruption(&path, "block exceeds frame limit")
        })?;
        state.writer.file.write_all(&len.to_le_bytes()).map_err(|e| io_err(&path, e))?;
        state.writer.file.write_all(&bytes).map_err(|e| io_err(&path, e))?;
        // The caller's durability promise rides on this fsync.
        state.writer.file.sync_data().map_err(|e| io_err(&path, e))?;

        let header = block.header().clone();
        let offset = state.writer.len;
        let segment = state.writer.segment;
        state.by_prev.entry(header.prev_hash()).or_default().insert(hash);
        state.by_slot.entry(header.slot()).or_default().insert(hash);
        state.index.insert(hash, StoredBlock { segment, offset, header });
        *state.segments.entry(segment).or_default() += 1;
        state.writer.len += FRAME_PREFIX_SIZE + bytes.len() as u64;
        state.writer.blocks += 1;
        metrics::VOLATILE_BLOCKS.set(state.index.len() as i64);

        if state.writer.blocks >= self.max_blocks_per_file {
            let next = state.writer.segment + 1;
            state.writer = open_writer(&self.dir, next)?;
            state.segments.insert(next, 0);
            metrics::VOLATILE_SEGMENTS.set(state.segments.len() as i64);
        }
        Ok(true)
    }

    /// Reads a block back. `None` for unknown hashes; failure to decode a
    /// block we know we stored is corruption.
    pub fn get(&self, hash: &BlockHash) -> Result<Option<Block>, StoreError> {
        let stored = {
            let state = self.state.lock();
            match state.index.get(hash) {
                Some(stored) => stored.clone(),
                None => return Ok(None),
            }
        };
        let path = segment_file(&self.dir, stored.segment);
        let mut file = File::open(&path).map_err(|e| io_err(&path, e))?;
        let bytes = read_frame_at(&mut file, stored.offset)
            .map_err(|e| io_err(&path, e))?
            .ok_or_else(|| StoreError::corruption(&path, "indexed frame extends past end of segment"))?;
        let block = Block::from_bytes(&bytes)
            .map_err(|e| StoreError::corruption(&path, format!("stored block: {e}")))?;
        if block.hash() != *hash {
            return Err(StoreError::corruption(&path, "stored block hash mismatch"));
        }
        Ok(Some(block))
    }

    /// Header (and therefore slot, number, parent and boundary flag) of a
    /// pooled block.
    pub fn get_header(&self, hash: &BlockHash) -> Option<BlockHeader> {
        self.state.lock().index.get(hash).map(|stored| stored.header.clone())
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.state.lock().index.contains_key(hash)
    }

    pub fn contains_point(&self, point: &Point) -> bool {
        match point {
            Point::Origin => false,
            Point::Block(slot, hash) => self
                .state
                .lock()
                .index
                .get(hash)
                .is_some_and(|stored| stored.header.slot() == *slot),
        }
    }

    /// Hashes of the pooled blocks whose parent link is `prev`.
    pub fn successors(&self, prev: &PrevHash) -> HashSet<BlockHash> {
        self.state.lock().by_prev.get(prev).cloned().unwrap_or_default()
    }

    /// The chain-selection query: for each requested parent, the pooled
    /// children. Parents with no children are omitted.
    pub fn filter_by_predecessor<'a>(
        &self,
        prevs: impl IntoIterator<Item = &'a PrevHash>,
    ) -> HashMap<PrevHash, HashSet<BlockHash>> {
        let state = self.state.lock();
        prevs
            .into_iter()
            .filter_map(|prev| state.by_prev.get(prev).map(|set| (*prev, set.clone())))
            .collect()
    }

    /// Removes every block with `slot <= bound`. Segment files whose
    /// blocks are all gone are deleted. Idempotent.
    pub fn garbage_collect(&self, bound: Slot) -> Result<u64, StoreError> {
        let mut state = self.state.lock();
        let doomed: Vec<BlockHash> = state
            .by_slot
            .range(..=bound)
            .flat_map(|(_, hashes)| hashes.iter().copied())
            .collect();
        let removed = doomed.len() as u64;
        for hash in doomed {
            let Some(stored) = state.index.remove(&hash) else { continue };
            let prev = stored.header.prev_hash();
            if let Some(siblings) = state.by_prev.get_mut(&prev) {
                siblings.remove(&hash);
                if siblings.is_empty() {
                    state.by_prev.remove(&prev);
                }
            }
            if let Some(count) = state.segments.get_mut(&stored.segment) {
                *count = count.saturating_sub(1);
            }
        }
        let kept = state.by_slot.split_off(&(bound + 1));
        state.by_slot = kept;

        let writer_segment = state.writer.segment;
        let dead: Vec<u64> = state
            .segments
            .iter()
            .filter(|&(&segment, &live)| live == 0 && segment != writer_segment)
            .map(|(&segment, _)| segment)
            .collect();
        for segment in dead {
            let path = segment_file(&self.dir, segment);
            fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
            state.segments.remove(&segment);
            tracing::debug!(target: "gc", segment, "deleted empty volatile segment");
        }

        metrics::VOLATILE_BLOCKS.set(state.index.len() as i64);
        metrics::VOLATILE_SEGMENTS.set(state.segments.len() as i64);
        if removed > 0 {
            tracing::debug!(target: "gc", bound, removed, "collected volatile blocks");
        }
        Ok(removed)
    }

    /// Slot of the newest pooled block.
    pub fn max_slot(&self) -> Option<Slot> {
        self.state.lock().by_slot.keys().next_back().copied()
    }

    pub fn block_count(&self) -> usize {
        self.state.lock().index.len()
    }

    pub fn segment_count(&self) -> usize {
        self.state.lock().segments.len()
    }
}

fn open_writer(dir: &Path, segment: u64) -> Result<SegmentWriter, StoreError> {
    let path = segment_file(dir, segment);
    let file =
        OpenOptions::new().create_new(true).append(true).open(&path).map_err(|e| io_err(&path, e))?;
    Ok(SegmentWriter { segment, file, blocks: 0, len: 0 })
}

fn scan_segments(dir: &Path) -> Result<Vec<u64>, StoreError> {
    let mut ids = Vec::new();
    for dir_entry in fs::read_dir(dir).map_err(|e| io_err(dir, e))? {
        let dir_entry = dir_entry.map_err(|e| io_err(dir, e))?;
        let name = dir_entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(id) = name.strip_prefix("blocks-").and_then(|s| s.strip_suffix(".dat")) {
            if let Ok(id) = id.parse::<u64>() {
                ids.push(id);
            }
        }
    }
    Ok(ids)
}

fn read_frame_at(file: &mut File, offset: u64) -> std::io::Result<Option<Vec<u8>>> {
    use std::io::{Read, Seek, SeekFrom};
    let file_len = file.metadata()?.len();
    if offset + FRAME_PREFIX_SIZE > file_len {
        return Ok(None);
    }
    file.seek(SeekFrom::Start(offset))?;
    let mut prefix = [0u8; 4];
    file.read_exact(&mut prefix)?;
    let len = u32::from_le_bytes(prefix) as u64;
    if offset + FRAME_PREFIX_SIZE + len > file_len {
        return Ok(None);
    }
    let mut bytes = vec![0u8; len as usize];
    file.read_exact(&mut bytes)?;
    Ok(Some(bytes))
}

/// Walks a segment file frame by frame, truncating at the first torn or
/// undecodable block. Returns `(offset, header)` per recovered block.
fn recover_segment(
    dir: &Path,
    segment: u64,
    validation: VolatileValidation,
) -> Result<Vec<(u64, BlockHeader)>, StoreError> {
    let path = segment_file(dir, segment);
    let mut file = File::open(&path).map_err(|e| io_err(&path, e))?;
    let file_len = file.metadata().map_err(|e| io_err(&path, e))?.len();

    let mut blocks = Vec::new();
    let mut offset = 0u64;
    while offset < file_len {
        let Some(bytes) = read_frame_at(&mut file, offset).map_err(|e| io_err(&path, e))? else {
            break;
        };
        let header = match validation {
            VolatileValidation::ValidateAll => match Block::from_bytes(&bytes) {
                Ok(block) => block.header().clone(),
                Err(error) => {
                    tracing::warn!(target: "store", segment, offset, %error, "undecodable pooled block; truncating segment");
                    break;
                }
            },
            VolatileValidation::NoValidation => {
                use borsh::BorshDeserialize;
                let mut reader = bytes.as_slice();
                match BlockHeader::deserialize_reader(&mut reader) {
                    Ok(mut header) => {
                        header.init();
                        header
                    }
                    Err(error) => {
                        tracing::warn!(target: "store", segment, offset, %error, "unparseable pooled header; truncating segment");
                        break;
                    }
                }
            }
        };
        blocks.push((offset, header));
        offset += FRAME_PREFIX_SIZE + bytes.len() as u64;
    }

    if offset < file_len {
        tracing::warn!(target: "store", segment, offset, file_len, "truncating torn volatile segment");
        let rw = OpenOptions::new().write(true).open(&path).map_err(|e| io_err(&path, e))?;
        rw.set_len(offset).map_err(|e| io_err(&path, e))?;
        rw.sync_data().map_err(|e| io_err(&path, e))?;
    }
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_primitives::Tip;
    use weft_primitives::test_utils::{TestBlockBuilder, build_chain_on};

    fn open(dir: &Path, max: u32) -> VolatileDb {
        VolatileDb::open(dir, max, VolatileValidation::ValidateAll).unwrap()
    }

    #[test]
    fn put_get_and_idempotence() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path(), 10);
        let blocks = build_chain_on(&Tip::genesis(), 3);
        for block in &blocks {
            assert!(db.put(block).unwrap());
        }
        assert!(!db.put(&blocks[1]).unwrap());
        assert_eq!(db.block_count(), 3);
        assert_eq!(db.get(&blocks[2].hash()).unwrap().unwrap(), blocks[2]);
        assert_eq!(db.get_header(&blocks[0].hash()).unwrap(), *blocks[0].header());
        assert_eq!(db.get(&BlockHash::hash_bytes(b"unknown")).unwrap(), None);
    }

    #[test]
    fn successor_index_tracks_forks() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path(), 10);
        let base = TestBlockBuilder::from_tip(&Tip::genesis()).build();
        let a = TestBlockBuilder::new(base.header()).issuer(1).build();
        let b = TestBlockBuilder::new(base.header()).issuer(2).build();
        for block in [&base, &a, &b] {
            db.put(block).unwrap();
        }
        let children = db.successors(&PrevHash::Block(base.hash()));
        assert_eq!(children, HashSet::from([a.hash(), b.hash()]));

        let map = db.filter_by_predecessor([&PrevHash::Genesis, &PrevHash::Block(base.hash())]);
        assert_eq!(map[&PrevHash::Genesis], HashSet::from([base.hash()]));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn gc_removes_by_slot_and_deletes_segments() {
        let dir = tempfile::tempdir().unwrap();
        // Two blocks per segment file.
        let db = open(dir.path(), 2);
        let blocks = build_chain_on(&Tip::genesis(), 6);
        for block in &blocks {
            db.put(block).unwrap();
        }
        let before = db.segment_count();
        assert!(before >= 3);

        // Slots are 1..=6; collect the first four.
        let removed = db.garbage_collect(4).unwrap();
        assert_eq!(removed, 4);
        assert_eq!(db.block_count(), 2);
        assert!(!db.contains(&blocks[0].hash()));
        assert!(db.contains(&blocks[5].hash()));
        assert!(db.segment_count() < before);

        // Idempotent.
        assert_eq!(db.garbage_collect(4).unwrap(), 0);
    }

    #[test]
    fn reopen_recovers_index() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = build_chain_on(&Tip::genesis(), 5);
        {
            let db = open(dir.path(), 2);
            for block in &blocks {
                db.put(block).unwrap();
            }
        }
        let db = open(dir.path(), 2);
        assert_eq!(db.block_count(), 5);
        for block in &blocks {
            assert_eq!(db.get(&block.hash()).unwrap().unwrap(), *block);
        }
        assert_eq!(db.successors(&PrevHash::Block(blocks[0].hash())), HashSet::from([blocks[1].hash()]));
    }

    #[test]
    fn torn_segment_tail_truncated_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = build_chain_on(&Tip::genesis(), 3);
        {
            let db = open(dir.path(), 10);
            for block in &blocks {
                db.put(block).unwrap();
            }
        }
        let path = segment_file(dir.path(), 0);
        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 2).unwrap();

        let db = open(dir.path(), 10);
        assert_eq!(db.block_count(), 2);
        assert!(!db.contains(&blocks[2].hash()));
        assert!(db.contains(&blocks[1].hash()));
    }

    #[test]
    fn gc_spares_future_slots() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path(), 10);
        let early = TestBlockBuilder::from_tip(&Tip::genesis()).slot(3).build();
        let late = TestBlockBuilder::new(early.header()).slot(20).build();
        db.put(&early).unwrap();
        db.put(&late).unwrap();
        db.garbage_collect(10).unwrap();
        assert!(!db.contains(&early.hash()));
        assert!(db.contains(&late.hash()));
        assert_eq!(db.max_slot(), Some(20));
    }
}
