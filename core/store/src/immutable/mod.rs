//! Append-only store for the settled prefix of the chain.
//!
//! Blocks are partitioned into chunk files on a fixed slot schedule (one
//! chunk per epoch). Appends go to the newest chunk; reads address any
//! chunk through its primary (slot) and secondary (block) indexes. On
//! open the store validates and, where necessary, truncates the tail back
//! to the last consistent block.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use weft_primitives::block::PrevHash;
use weft_primitives::types::ChunkIndex;
use weft_primitives::{Block, BlockHeader, Point, Slot, Tip};

use crate::{BlockComponent, ComponentValue, ImmutableValidation, StoreError, io_err, metrics};

mod index;
mod iterator;

pub use index::SecondaryEntry;
pub use iterator::{ImmutableStream, StreamError, StreamFrom};

use index::{KIND_BOUNDARY, KIND_ORDINARY, SECONDARY_ENTRY_SIZE};

/// Maps slots onto the chunk schedule.
#[derive(Copy, Clone, Debug)]
pub struct ChunkLayout {
    pub slots_per_chunk: u64,
}

impl ChunkLayout {
    pub fn chunk_of(&self, slot: Slot) -> ChunkIndex {
        slot / self.slots_per_chunk
    }

    pub fn first_slot(&self, chunk: ChunkIndex) -> Slot {
        chunk * self.slots_per_chunk
    }

    pub fn relative_slot(&self, slot: Slot) -> u64 {
        slot % self.slots_per_chunk
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppendError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("block {point} does not extend the immutable tip {tip}")]
    DoesNotExtendTip { point: Point, tip: Point },
    #[error("slot {got} does not advance past the tip slot {tip}")]
    SlotNotAdvancing { got: Slot, tip: Slot },
    #[error("boundary block at slot {got} must sit at its epoch's first slot {want}")]
    BoundaryOffEpochStart { got: Slot, want: Slot },
}

pub(crate) fn chunk_file(dir: &Path, chunk: ChunkIndex) -> PathBuf {
    dir.join(format!("{chunk:06}.chunk"))
}

pub(crate) fn primary_file(dir: &Path, chunk: ChunkIndex) -> PathBuf {
    dir.join(format!("{chunk:06}.primary"))
}

pub(crate) fn secondary_file(dir: &Path, chunk: ChunkIndex) -> PathBuf {
    dir.join(format!("{chunk:06}.secondary"))
}

/// The append-only block log.
pub struct ImmutableDb {
    dir: PathBuf,
    layout: ChunkLayout,
    state: Mutex<ImmState>,
}

struct ImmState {
    chunks: BTreeSet<ChunkIndex>,
    tip: Tip,
    block_count: u64,
    current: Option<OpenChunk>,
}

/// Write handles for the newest chunk.
struct OpenChunk {
    index: ChunkIndex,
    chunk: File,
    secondary: File,
    primary: File,
    chunk_len: u64,
    entries: u32,
}

/// A block found through the indexes.
#[derive(Clone, Debug)]
pub(crate) struct Located {
    pub chunk: ChunkIndex,
    pub entry: SecondaryEntry,
}

impl ImmutableDb {
    /// Opens the store, validating according to `validation` and
    /// truncating the tail back to the last consistent block if needed.
    pub fn open(
        dir: &Path,
        layout: ChunkLayout,
        validation: ImmutableValidation,
    ) -> Result<Self, StoreError> {
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        let mut chunks = scan_chunks(dir)?;

        let tip = match validation {
            ImmutableValidation::ValidateAllChunks => {
                validate_all(dir, layout, &mut chunks)?
            }
            ImmutableValidation::ValidateMostRecentChunk => {
                validate_tail(dir, layout, &mut chunks)?
            }
        };

        let mut block_count = 0;
        for &chunk in &chunks {
            let len = fs::metadata(secondary_file(dir, chunk))
                .map_err(|e| io_err(&secondary_file(dir, chunk), e))?
                .len();
            block_count += len / SECONDARY_ENTRY_SIZE;
        }
        metrics::IMMUTABLE_CHUNKS.set(chunks.len() as i64);

        tracing::info!(
            target: "store",
            chunks = chunks.len(),
            blocks = block_count,
            tip = %tip.point,
            "opened immutable store",
        );
        Ok(ImmutableDb {
            dir: dir.to_path_buf(),
            layout,
            state: Mutex::new(ImmState { chunks, tip, block_count, current: None }),
        })
    }

    pub fn tip(&self) -> Tip {
        self.state.lock().tip
    }

    pub fn chunk_count(&self) -> usize {
        self.state.lock().chunks.len()
    }

    pub fn block_count(&self) -> u64 {
        self.state.lock().block_count
    }

    /// Appends a block extending the current tip. Does not fsync; call
    /// [`ImmutableDb::sync`] after a committed batch.
    pub fn append(&self, block: &Block) -> Result<(), AppendError> {
        let mut state = self.state.lock();
        let header = block.header();
        let tip = state.tip;

        let extends = match tip.point {
            Point::Origin => header.prev_hash() == PrevHash::Genesis,
            Point::Block(_, tip_hash) => header.prev_hash() == PrevHash::Block(tip_hash),
        };
        if !extends {
            return Err(AppendError::DoesNotExtendTip { point: header.point(), tip: tip.point });
        }
        if let Some(tip_slot) = tip.slot() {
            // An ordinary block is allowed to share the slot of the
            // boundary block it follows.
            let shares_slot = tip.is_boundary && !header.is_boundary();
            let ok = if shares_slot { header.slot() >= tip_slot } else { header.slot() > tip_slot };
            if !ok {
                return Err(AppendError::SlotNotAdvancing { got: header.slot(), tip: tip_slot });
            }
        }
        if header.is_boundary() {
            let want = self.layout.first_slot(self.layout.chunk_of(header.slot()));
            if header.slot() != want {
                return Err(AppendError::BoundaryOffEpochStart { got: header.slot(), want });
            }
        }

        let target = self.layout.chunk_of(header.slot());
        self.ensure_current_chunk(&mut state, target)?;
        let relative_slot = self.layout.relative_slot(header.slot());
        let bytes = block.to_bytes();
        let header_size = header.serialized_size() as u16;
        let current = state.current.as_mut().expect("current chunk just ensured");

        let entry = SecondaryEntry {
            offset: current.chunk_len,
            header_offset: 0,
            header_size,
            hash: *header.hash().as_bytes(),
            kind: if header.is_boundary() { KIND_BOUNDARY } else { KIND_ORDINARY },
        };
        index::append_frame(&mut current.chunk, &bytes)
            .map_err(|e| io_err(&chunk_file(&self.dir, target), e))?;
        index::append_secondary(&mut current.secondary, &entry)
            .map_err(|e| io_err(&secondary_file(&self.dir, target), e))?;
        let (position, count) = index::read_primary_at(&mut current.primary, relative_slot)
            .map_err(|e| io_err(&primary_file(&self.dir, target), e))?;
        let (position, count) =
            if count > 0 { (position, count + 1) } else { (current.entries, 1) };
        index::write_primary_at(&mut current.primary, relative_slot, position, count)
            .map_err(|e| io_err(&primary_file(&self.dir, target), e))?;

        current.chunk_len += index::FRAME_PREFIX_SIZE + bytes.len() as u64;
        current.entries += 1;
        state.tip = header.tip();
        state.block_count += 1;
        metrics::IMMUTABLE_BLOCKS_APPENDED_TOTAL.inc();
        Ok(())
    }

    /// Flushes the open chunk's files to disk. Called after each committed
    /// append batch.
    pub fn sync(&self) -> Result<(), StoreError> {
        let state = self.state.lock();
        let Some(current) = state.current.as_ref() else { return Ok(()) };
        for (file, path) in [
            (&current.chunk, chunk_file(&self.dir, current.index)),
            (&current.secondary, secondary_file(&self.dir, current.index)),
            (&current.primary, primary_file(&self.dir, current.index)),
        ] {
            file.sync_data().map_err(|e| io_err(&path, e))?;
        }
        Ok(())
    }

    pub fn contains(&self, point: &Point) -> Result<bool, StoreError> {
        Ok(self.locate(point)?.is_some())
    }

    /// Reads one component of the block at `point`. `None` when the point
    /// is not in the store.
    pub fn get_component(
        &self,
        point: &Point,
        component: BlockComponent,
    ) -> Result<Option<ComponentValue>, StoreError> {
        let Some(located) = self.locate(point)? else { return Ok(None) };
        Ok(Some(self.read_component(&located, component)?))
    }

    pub fn get_block(&self, point: &Point) -> Result<Option<Block>, StoreError> {
        Ok(self.get_component(point, BlockComponent::Block)?.and_then(ComponentValue::into_block))
    }

    pub fn get_header(&self, point: &Point) -> Result<Option<BlockHeader>, StoreError> {
        Ok(self
            .get_component(point, BlockComponent::Header)?
            .and_then(ComponentValue::into_header))
    }

    /// Streams `(point, component)` pairs across the requested range.
    pub fn stream(
        &self,
        from: StreamFrom,
        to: Point,
        component: BlockComponent,
    ) -> Result<ImmutableStream, StreamError> {
        iterator::stream(self, from, to, component)
    }

    /// Slot of the oldest stored block.
    pub fn earliest_slot(&self) -> Result<Option<Slot>, StoreError> {
        let chunks = { self.state.lock().chunks.clone() };
        for chunk in chunks {
            let occupied = index::read_primary(&primary_file(&self.dir, chunk))?;
            if let Some((relative_slot, _, _)) = occupied.first() {
                return Ok(Some(self.layout.first_slot(chunk) + relative_slot));
            }
        }
        Ok(None)
    }

    pub(crate) fn layout(&self) -> ChunkLayout {
        self.layout
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn chunk_list(&self) -> Vec<ChunkIndex> {
        self.state.lock().chunks.iter().copied().collect()
    }

    /// Finds the slot-and-entry for a point, consulting the indexes only.
    pub(crate) fn locate(&self, point: &Point) -> Result<Option<Located>, StoreError> {
        let Point::Block(slot, hash) = point else { return Ok(None) };
        let chunk = self.layout.chunk_of(*slot);
        if !self.state.lock().chunks.contains(&chunk) {
            return Ok(None);
        }
        let primary_path = primary_file(&self.dir, chunk);
        let mut primary = File::open(&primary_path).map_err(|e| io_err(&primary_path, e))?;
        let (position, count) = index::read_primary_at(&mut primary, self.layout.relative_slot(*slot))
            .map_err(|e| io_err(&primary_path, e))?;
        if count == 0 {
            return Ok(None);
        }
        let (entries, _) = index::read_secondary(&secondary_file(&self.dir, chunk))?;
        for offset in 0..count as usize {
            let Some(entry) = entries.get(position as usize + offset) else {
                return Err(StoreError::corruption(
                    secondary_file(&self.dir, chunk),
                    "primary index points past the secondary index",
                ));
            };
            if entry.hash == *hash.as_bytes() {
                return Ok(Some(Located { chunk, entry: *entry }));
            }
        }
        Ok(None)
    }

    /// Reads the stored bytes a secondary entry describes. The entry came
    /// from the index, so a short or missing frame is corruption.
    pub(crate) fn read_entry_bytes(&self, located: &Located) -> Result<Vec<u8>, StoreError> {
        let path = chunk_file(&self.dir, located.chunk);
        let mut file = File::open(&path).map_err(|e| io_err(&path, e))?;
        match index::read_frame_at(&mut file, located.entry.offset).map_err(|e| io_err(&path, e))? {
            Some(bytes) => Ok(bytes),
            None => Err(StoreError::corruption(&path, "indexed frame extends past end of chunk")),
        }
    }

    pub(crate) fn read_component(
        &self,
        located: &Located,
        component: BlockComponent,
    ) -> Result<ComponentValue, StoreError> {
        let bytes = self.read_entry_bytes(located)?;
        component_from_bytes(&chunk_file(&self.dir, located.chunk), &located.entry, bytes, component)
    }

    fn ensure_current_chunk(
        &self,
        state: &mut ImmState,
        target: ChunkIndex,
    ) -> Result<(), StoreError> {
        if state.current.as_ref().is_some_and(|c| c.index == target) {
            return Ok(());
        }
        if let Some(previous) = state.current.take() {
            debug_assert!(previous.index < target);
            for (file, path) in [
                (&previous.chunk, chunk_file(&self.dir, previous.index)),
                (&previous.secondary, secondary_file(&self.dir, previous.index)),
                (&previous.primary, primary_file(&self.dir, previous.index)),
            ] {
                file.sync_data().map_err(|e| io_err(&path, e))?;
            }
        }

        let existing = state.chunks.contains(&target);
        let open_rw = |path: &Path| {
            OpenOptions::new().create(true).read(true).write(true).open(path)
        };
        let open_append = |path: &Path| OpenOptions::new().create(true).append(true).open(path);

        let chunk_path = chunk_file(&self.dir, target);
        let chunk = open_append(&chunk_path).map_err(|e| io_err(&chunk_path, e))?;
        let secondary_path = secondary_file(&self.dir, target);
        let secondary = open_append(&secondary_path).map_err(|e| io_err(&secondary_path, e))?;
        let primary_path = primary_file(&self.dir, target);
        let primary = open_rw(&primary_path).map_err(|e| io_err(&primary_path, e))?;

        let (chunk_len, entries) = if existing {
            let chunk_len =
                chunk.metadata().map_err(|e| io_err(&chunk_path, e))?.len();
            let secondary_len =
                secondary.metadata().map_err(|e| io_err(&secondary_path, e))?.len();
            (chunk_len, (secondary_len / SECONDARY_ENTRY_SIZE) as u32)
        } else {
            (0, 0)
        };

        state.chunks.insert(target);
        metrics::IMMUTABLE_CHUNKS.set(state.chunks.len() as i64);
        state.current =
            Some(OpenChunk { index: target, chunk, secondary, primary, chunk_len, entries });
        Ok(())
    }
}

pub(crate) fn component_from_bytes(
    path: &Path,
    entry: &SecondaryEntry,
    bytes: Vec<u8>,
    component: BlockComponent,
) -> Result<ComponentValue, StoreError> {
    match component {
        BlockComponent::Size => Ok(ComponentValue::Size(bytes.len() as u32)),
        BlockComponent::Bytes => Ok(ComponentValue::Bytes(bytes)),
        BlockComponent::Block => {
            let block = Block::from_bytes(&bytes)
                .map_err(|e| StoreError::corruption(path, format!("stored block: {e}")))?;
            Ok(ComponentValue::Block(block))
        }
        BlockComponent::Header => {
            let start = entry.header_offset as usize;
            let end = start + entry.header_size as usize;
            let header_bytes = bytes.get(start..end).ok_or_else(|| {
                StoreError::corruption(path, "header range outside stored block")
            })?;
            let header = BlockHeader::from_bytes(header_bytes)
                .map_err(|e| StoreError::corruption(path, format!("stored header: {e}")))?;
            Ok(ComponentValue::Header(header))
        }
    }
}

/// Entries of a chunk in append order, with slots restored from the
/// primary index.
pub(crate) fn chunk_entries_on_disk(
    dir: &Path,
    layout: ChunkLayout,
    chunk: ChunkIndex,
) -> Result<Vec<(Slot, SecondaryEntry)>, StoreError> {
    let (entries, _) = index::read_secondary(&secondary_file(dir, chunk))?;
    let occupied = index::read_primary(&primary_file(dir, chunk))?;
    let mut slots = vec![None; entries.len()];
    for (relative_slot, position, count) in occupied {
        for offset in 0..count as u64 {
            let Some(slot) = slots.get_mut((position as u64 + offset) as usize) else {
                return Err(StoreError::corruption(
                    primary_file(dir, chunk),
                    "primary index points past the secondary index",
                ));
            };
            *slot = Some(layout.first_slot(chunk) + relative_slot);
        }
    }
    entries
        .into_iter()
        .zip(slots)
        .map(|(entry, slot)| match slot {
            Some(slot) => Ok((slot, entry)),
            None => Err(StoreError::corruption(
                primary_file(dir, chunk),
                "secondary entry missing from the primary index",
            )),
        })
        .collect()
}

fn scan_chunks(dir: &Path) -> Result<BTreeSet<ChunkIndex>, StoreError> {
    let mut chunks = BTreeSet::new();
    for dir_entry in fs::read_dir(dir).map_err(|e| io_err(dir, e))? {
        let dir_entry = dir_entry.map_err(|e| io_err(dir, e))?;
        let name = dir_entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(stem) = name.strip_suffix(".chunk") {
            if let Ok(chunk) = stem.parse::<ChunkIndex>() {
                chunks.insert(chunk);
            }
        }
    }
    Ok(chunks)
}

/// Full validation: walk every chunk in order re-parsing every block and
/// checking the linkage. Returns the resulting tip.
fn validate_all(
    dir: &Path,
    layout: ChunkLayout,
    chunks: &mut BTreeSet<ChunkIndex>,
) -> Result<Tip, StoreError> {
    let mut tip = Tip::genesis();
    let order: Vec<ChunkIndex> = chunks.iter().copied().collect();
    for (i, chunk) in order.iter().copied().enumerate() {
        let outcome = validate_chunk(dir, layout, chunk, tip)?;
        tip = outcome.tip;
        if outcome.emptied {
            chunks.remove(&chunk);
        }
        if outcome.truncated || outcome.emptied {
            // Whatever followed the truncation point no longer links up.
            for later in &order[i + 1..] {
                delete_chunk(dir, *later)?;
                chunks.remove(later);
            }
            break;
        }
    }
    Ok(tip)
}

/// Tail validation: trust every chunk but the newest. Walks backwards
/// while truncation empties chunks entirely.
fn validate_tail(
    dir: &Path,
    layout: ChunkLayout,
    chunks: &mut BTreeSet<ChunkIndex>,
) -> Result<Tip, StoreError> {
    loop {
        let Some(&last) = chunks.iter().next_back() else { return Ok(Tip::genesis()) };
        let prev_tip = match chunks.iter().rev().nth(1) {
            Some(&prev) => trusted_chunk_tip(dir, prev)?,
            None => Tip::genesis(),
        };
        let outcome = validate_chunk(dir, layout, last, prev_tip)?;
        if outcome.emptied {
            chunks.remove(&last);
            continue;
        }
        return Ok(outcome.tip);
    }
}

/// Tip of a chunk whose indexes are trusted: reads the last entry's header
/// without re-hashing the chunk.
fn trusted_chunk_tip(dir: &Path, chunk: ChunkIndex) -> Result<Tip, StoreError> {
    let (entries, _) = index::read_secondary(&secondary_file(dir, chunk))?;
    let Some(entry) = entries.last() else {
        return Err(StoreError::corruption(
            secondary_file(dir, chunk),
            "trusted chunk has no entries",
        ));
    };
    let path = chunk_file(dir, chunk);
    let mut file = File::open(&path).map_err(|e| io_err(&path, e))?;
    let bytes = index::read_frame_at(&mut file, entry.offset)
        .map_err(|e| io_err(&path, e))?
        .ok_or_else(|| StoreError::corruption(&path, "indexed frame extends past end of chunk"))?;
    let value = component_from_bytes(&path, entry, bytes, BlockComponent::Header)?;
    let header = value.into_header().expect("requested a header");
    Ok(header.tip())
}

struct ChunkOutcome {
    tip: Tip,
    truncated: bool,
    emptied: bool,
}

/// Re-parses a chunk block-by-block, truncating at the first torn frame,
/// undecodable block, or linkage break, and rewrites the index files when
/// they disagree with what was read back.
fn validate_chunk(
    dir: &Path,
    layout: ChunkLayout,
    chunk: ChunkIndex,
    prev_tip: Tip,
) -> Result<ChunkOutcome, StoreError> {
    let path = chunk_file(dir, chunk);
    let mut file = File::open(&path).map_err(|e| io_err(&path, e))?;
    let file_len = file.metadata().map_err(|e| io_err(&path, e))?.len();

    let mut tip = prev_tip;
    let mut entries: Vec<(Slot, SecondaryEntry)> = Vec::new();
    let mut offset = 0u64;
    let mut truncated = false;

    while offset < file_len {
        let Some(bytes) = index::read_frame_at(&mut file, offset).map_err(|e| io_err(&path, e))?
        else {
            truncated = true;
            break;
        };
        let block = match Block::from_bytes(&bytes) {
            Ok(block) => block,
            Err(error) => {
                tracing::warn!(target: "store", %chunk, offset, %error, "undecodable block; truncating chunk");
                truncated = true;
                break;
            }
        };
        let header = block.header();
        let links = match tip.point {
            Point::Origin => header.prev_hash() == PrevHash::Genesis,
            Point::Block(_, hash) => header.prev_hash() == PrevHash::Block(hash),
        };
        let slot_ok = match tip.slot() {
            None => true,
            Some(tip_slot) if tip.is_boundary && !header.is_boundary() => {
                header.slot() >= tip_slot
            }
            Some(tip_slot) => header.slot() > tip_slot,
        };
        if !links || !slot_ok || layout.chunk_of(header.slot()) != chunk {
            tracing::warn!(target: "store", %chunk, offset, block = %header.point(), "block does not link; truncating chunk");
            truncated = true;
            break;
        }
        entries.push((
            header.slot(),
            SecondaryEntry {
                offset,
                header_offset: 0,
                header_size: header.serialized_size() as u16,
                hash: *header.hash().as_bytes(),
                kind: if header.is_boundary() { KIND_BOUNDARY } else { KIND_ORDINARY },
            },
        ));
        tip = header.tip();
        offset += index::FRAME_PREFIX_SIZE + bytes.len() as u64;
    }

    if entries.is_empty() {
        tracing::warn!(target: "store", %chunk, "chunk emptied by validation; deleting");
        delete_chunk(dir, chunk)?;
        return Ok(ChunkOutcome { tip: prev_tip, truncated: true, emptied: true });
    }

    if truncated {
        let rw = OpenOptions::new().write(true).open(&path).map_err(|e| io_err(&path, e))?;
        rw.set_len(offset).map_err(|e| io_err(&path, e))?;
        rw.sync_data().map_err(|e| io_err(&path, e))?;
    }

    rewrite_indexes_if_stale(dir, layout, chunk, &entries)?;
    Ok(ChunkOutcome { tip, truncated, emptied: false })
}

fn rewrite_indexes_if_stale(
    dir: &Path,
    layout: ChunkLayout,
    chunk: ChunkIndex,
    entries: &[(Slot, SecondaryEntry)],
) -> Result<(), StoreError> {
    let secondary_path = secondary_file(dir, chunk);
    let stale = match index::read_secondary(&secondary_path) {
        Ok((on_disk, trailing)) => {
            trailing != 0
                || on_disk.len() != entries.len()
                || on_disk.iter().zip(entries).any(|(a, (_, b))| a != b)
        }
        Err(_) => true,
    };
    if !stale {
        return Ok(());
    }
    tracing::warn!(target: "store", %chunk, "rewriting stale chunk indexes");

    let mut secondary = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&secondary_path)
        .map_err(|e| io_err(&secondary_path, e))?;
    for (_, entry) in entries {
        index::append_secondary(&mut secondary, entry).map_err(|e| io_err(&secondary_path, e))?;
    }
    secondary.sync_data().map_err(|e| io_err(&secondary_path, e))?;

    let primary_path = primary_file(dir, chunk);
    let mut primary = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&primary_path)
        .map_err(|e| io_err(&primary_path, e))?;
    let mut position = 0u32;
    let mut run: Option<(u64, u32, u8)> = None;
    for (slot, _) in entries {
        let relative_slot = layout.relative_slot(*slot);
        match &mut run {
            Some((current, _, count)) if *current == relative_slot => *count += 1,
            _ => {
                if let Some((relative_slot, position, count)) = run.take() {
                    index::write_primary_at(&mut primary, relative_slot, position, count)
                        .map_err(|e| io_err(&primary_path, e))?;
                }
                run = Some((relative_slot, position, 1));
            }
        }
        position += 1;
    }
    if let Some((relative_slot, position, count)) = run {
        index::write_primary_at(&mut primary, relative_slot, position, count)
            .map_err(|e| io_err(&primary_path, e))?;
    }
    primary.sync_data().map_err(|e| io_err(&primary_path, e))?;
    Ok(())
}

fn delete_chunk(dir: &Path, chunk: ChunkIndex) -> Result<(), StoreError> {
    for path in [chunk_file(dir, chunk), primary_file(dir, chunk), secondary_file(dir, chunk)] {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(&path, e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use weft_primitives::test_utils::{TestBlockBuilder, build_chain_on};

    fn small_layout() -> ChunkLayout {
        ChunkLayout { slots_per_chunk: 10 }
    }

    fn open_fresh(dir: &Path) -> ImmutableDb {
        ImmutableDb::open(dir, small_layout(), ImmutableValidation::ValidateAllChunks).unwrap()
    }

    #[test]
    fn append_lookup_and_tip() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_fresh(dir.path());
        let blocks = build_chain_on(&Tip::genesis(), 5);
        for block in &blocks {
            db.append(block).unwrap();
        }
        db.sync().unwrap();

        assert_eq!(db.tip().point, blocks[4].point());
        assert_eq!(db.block_count(), 5);
        let got = db.get_block(&blocks[2].point()).unwrap().unwrap();
        assert_eq!(&got, &blocks[2]);
        let header = db.get_header(&blocks[0].point()).unwrap().unwrap();
        assert_eq!(&header, blocks[0].header());
        assert!(db.get_block(&Point::Block(99, blocks[0].hash())).unwrap().is_none());
    }

    #[test]
    fn append_rejects_non_extending_block() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_fresh(dir.path());
        let blocks = build_chain_on(&Tip::genesis(), 2);
        db.append(&blocks[0]).unwrap();
        // Skips blocks[1], so the parent link is wrong.
        let orphan = TestBlockBuilder::new(blocks[1].header()).build();
        assert_matches!(db.append(&orphan), Err(AppendError::DoesNotExtendTip { .. }));

        db.append(&blocks[1]).unwrap();
        let stale = TestBlockBuilder::new(blocks[1].header()).slot(blocks[1].header().slot()).build();
        assert_matches!(db.append(&stale), Err(AppendError::SlotNotAdvancing { .. }));
    }

    #[test]
    fn boundary_block_shares_slot_with_successor() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_fresh(dir.path());
        // Slot 10 is the first slot of chunk 1 under the test layout.
        let boundary = TestBlockBuilder::from_tip(&Tip::genesis()).slot(10).boundary().build();
        db.append(&boundary).unwrap();
        let ordinary =
            TestBlockBuilder::new(boundary.header()).slot(boundary.header().slot()).build();
        db.append(&ordinary).unwrap();
        db.sync().unwrap();

        assert_eq!(db.tip().point, ordinary.point());
        assert_eq!(db.get_block(&boundary.point()).unwrap().unwrap(), boundary);
        assert_eq!(db.get_block(&ordinary.point()).unwrap().unwrap(), ordinary);
    }

    #[test]
    fn misplaced_boundary_block_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_fresh(dir.path());
        let boundary = TestBlockBuilder::from_tip(&Tip::genesis()).slot(3).boundary().build();
        assert_matches!(db.append(&boundary), Err(AppendError::BoundaryOffEpochStart { .. }));
    }

    #[test]
    fn reopen_with_full_validation_preserves_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = build_chain_on(&Tip::genesis(), 25);
        {
            let db = open_fresh(dir.path());
            for block in &blocks {
                db.append(block).unwrap();
            }
            db.sync().unwrap();
        }
        let db = open_fresh(dir.path());
        assert_eq!(db.tip().point, blocks[24].point());
        assert_eq!(db.block_count(), 25);
        assert!(db.chunk_count() >= 3);
        for block in &blocks {
            assert_eq!(db.get_block(&block.point()).unwrap().unwrap(), *block);
        }
    }

    #[test]
    fn torn_tail_is_truncated_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = build_chain_on(&Tip::genesis(), 4);
        {
            let db = open_fresh(dir.path());
            for block in &blocks {
                db.append(block).unwrap();
            }
            db.sync().unwrap();
        }
        // Chop bytes off the end of the only chunk file, tearing the last
        // frame.
        let path = chunk_file(dir.path(), 0);
        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 3).unwrap();

        let db = open_fresh(dir.path());
        assert_eq!(db.tip().point, blocks[2].point());
        assert_eq!(db.block_count(), 3);
        assert!(db.get_block(&blocks[3].point()).unwrap().is_none());
    }

    #[test]
    fn corrupt_chunk_drops_later_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = build_chain_on(&Tip::genesis(), 25);
        {
            let db = open_fresh(dir.path());
            for block in &blocks {
                db.append(block).unwrap();
            }
            db.sync().unwrap();
        }
        // Flip a byte in the middle of chunk 1's first frame.
        let path = chunk_file(dir.path(), 1);
        let mut bytes = fs::read(&path).unwrap();
        bytes[10] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let db = open_fresh(dir.path());
        // Chunk 0 holds slots 1..=9: nine blocks survive.
        assert_eq!(db.block_count(), 9);
        assert_eq!(db.tip().point, blocks[8].point());
        assert_eq!(db.chunk_count(), 1);
        assert!(db.get_block(&blocks[15].point()).unwrap().is_none());
    }

    #[test]
    fn tail_validation_trusts_old_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = build_chain_on(&Tip::genesis(), 25);
        {
            let db = open_fresh(dir.path());
            for block in &blocks {
                db.append(block).unwrap();
            }
            db.sync().unwrap();
        }
        let db = ImmutableDb::open(
            dir.path(),
            small_layout(),
            ImmutableValidation::ValidateMostRecentChunk,
        )
        .unwrap();
        assert_eq!(db.tip().point, blocks[24].point());
        // Old chunks still serve reads.
        assert_eq!(db.get_block(&blocks[1].point()).unwrap().unwrap(), blocks[1]);
    }

    #[test]
    fn earliest_slot_reported() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_fresh(dir.path());
        assert_eq!(db.earliest_slot().unwrap(), None);
        let first = TestBlockBuilder::from_tip(&Tip::genesis()).slot(4).build();
        db.append(&first).unwrap();
        assert_eq!(db.earliest_slot().unwrap(), Some(4));
    }
}
