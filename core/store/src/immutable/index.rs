//! On-disk index records for the chunked immutable log.
//!
//! Every chunk `i` is three files: `{i:06}.chunk` holds length-framed
//! block bytes, `{i:06}.secondary` one fixed-size record per stored block
//! in append order, and `{i:06}.primary` one slot-table record per slot of
//! the chunk mapping it to the secondary position.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{StoreError, io_err};

/// Fixed-size record describing one block of a chunk.
#[derive(Copy, Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SecondaryEntry {
    /// Offset of the block's frame within the chunk file.
    pub offset: u64,
    /// Offset of the serialized header within the block bytes.
    pub header_offset: u16,
    /// Size of the serialized header.
    pub header_size: u16,
    pub hash: [u8; 32],
    /// 0 = ordinary block, 1 = epoch boundary block.
    pub kind: u8,
}

pub const KIND_ORDINARY: u8 = 0;
pub const KIND_BOUNDARY: u8 = 1;

/// Serialized size of a [`SecondaryEntry`]: 8 + 2 + 2 + 32 + 1.
pub const SECONDARY_ENTRY_SIZE: u64 = 45;

/// Serialized size of a primary record: u32 position + u8 count.
pub const PRIMARY_ENTRY_SIZE: u64 = 5;

/// Frames in the chunk file are a little-endian u32 length followed by
/// the block bytes.
pub const FRAME_PREFIX_SIZE: u64 = 4;

impl SecondaryEntry {
    pub fn is_boundary(&self) -> bool {
        self.kind == KIND_BOUNDARY
    }
}

/// Appends a frame to the chunk file. The caller tracks the write offset.
pub fn append_frame(file: &mut File, bytes: &[u8]) -> io::Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "block exceeds frame limit"))?;
    file.write_all(&len.to_le_bytes())?;
    file.write_all(bytes)
}

/// Reads the frame at `offset`. `None` when the frame extends past the end
/// of the file, which recovery treats as a torn trailing write.
pub fn read_frame_at(file: &mut File, offset: u64) -> io::Result<Option<Vec<u8>>> {
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

pub fn append_secondary(file: &mut File, entry: &SecondaryEntry) -> io::Result<()> {
    let bytes = borsh::to_vec(entry)?;
    debug_assert_eq!(bytes.len() as u64, SECONDARY_ENTRY_SIZE);
    file.write_all(&bytes)
}

/// Reads every complete secondary record; returns the records plus the
/// number of trailing bytes that did not form a whole record.
pub fn read_secondary(path: &Path) -> Result<(Vec<SecondaryEntry>, u64), StoreError> {
    let bytes = std::fs::read(path).map_err(|e| io_err(path, e))?;
    let whole = bytes.len() as u64 / SECONDARY_ENTRY_SIZE * SECONDARY_ENTRY_SIZE;
    let mut entries = Vec::with_capacity((whole / SECONDARY_ENTRY_SIZE) as usize);
    let mut cursor = &bytes[..whole as usize];
    while !cursor.is_empty() {
        let entry = SecondaryEntry::deserialize_reader(&mut cursor)
            .map_err(|e| io_err(path, e))?;
        entries.push(entry);
    }
    Ok((entries, bytes.len() as u64 - whole))
}

/// Writes the primary record for a relative slot. Unwritten slots read
/// back as empty thanks to sparse-file zero fill.
pub fn write_primary_at(
    file: &mut File,
    relative_slot: u64,
    position: u32,
    count: u8,
) -> io::Result<()> {
    file.seek(SeekFrom::Start(relative_slot * PRIMARY_ENTRY_SIZE))?;
    file.write_all(&position.to_le_bytes())?;
    file.write_all(&[count])
}

/// Reads the primary record for a relative slot: `(secondary position,
/// number of blocks in the slot)`. A count of zero means no block.
pub fn read_primary_at(file: &mut File, relative_slot: u64) -> io::Result<(u32, u8)> {
    let file_len = file.metadata()?.len();
    let offset = relative_slot * PRIMARY_ENTRY_SIZE;
    if offset + PRIMARY_ENTRY_SIZE > file_len {
        return Ok((0, 0));
    }
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = [0u8; PRIMARY_ENTRY_SIZE as usize];
    file.read_exact(&mut buf)?;
    let position = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    Ok((position, buf[4]))
}

/// Loads the whole primary table as `(relative slot, position, count)`
/// triples for the occupied slots, in slot order.
pub fn read_primary(path: &Path) -> Result<Vec<(u64, u32, u8)>, StoreError> {
    let bytes = std::fs::read(path).map_err(|e| io_err(path, e))?;
    let mut occupied = Vec::new();
    for (relative_slot, record) in bytes.chunks_exact(PRIMARY_ENTRY_SIZE as usize).enumerate() {
        let count = record[4];
        if count > 0 {
            let position = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
            occupied.push((relative_slot as u64, position, count));
        }
    }
    Ok(occupied)
}
