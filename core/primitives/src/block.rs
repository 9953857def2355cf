use borsh::{BorshDeserialize, BorshSerialize};

use crate::hash::BlockHash;
use crate::types::{BlockNumber, Point, Slot, Tip};

/// Parent link of a header: genesis for the first block of the chain,
/// otherwise the hash of the parent block.
#[derive(
    Copy, Clone, PartialEq, Eq, Debug, Hash, BorshSerialize, BorshDeserialize, serde::Serialize,
)]
pub enum PrevHash {
    Genesis,
    Block(BlockHash),
}

impl PrevHash {
    pub fn hash(&self) -> Option<BlockHash> {
        match self {
            PrevHash::Genesis => None,
            PrevHash::Block(hash) => Some(*hash),
        }
    }

    /// Whether this link points at the given position.
    pub fn points_at(&self, point: &Point) -> bool {
        match (self, point) {
            (PrevHash::Genesis, Point::Origin) => true,
            (PrevHash::Block(hash), Point::Block(_, point_hash)) => hash == point_hash,
            _ => false,
        }
    }
}

/// The hashed part of a header. The block hash commits to everything in
/// here, including the body root.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
struct HeaderInner {
    slot: Slot,
    block_no: BlockNumber,
    prev_hash: PrevHash,
    /// Epoch boundary block: an empty tick block sharing its slot with the
    /// subsequent ordinary block.
    is_boundary: bool,
    /// Identity of the producing node. Stands in for the protocol fields
    /// the consensus layer cares about.
    issuer: u64,
    /// Size of the block body in bytes, cached so consumers can budget
    /// fetches without downloading bodies.
    body_size: u32,
    /// Hash of the body bytes.
    body_root: BlockHash,
}

/// Block header. The prefix of a block that is enough to run chain
/// selection: position, parent link, boundary flag and size hint.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct BlockHeader {
    inner: HeaderInner,
    /// Hash of the serialized `inner`. Skipped on the wire and recomputed
    /// after deserialization.
    #[borsh(skip)]
    hash: BlockHash,
}

impl BlockHeader {
    pub fn new(
        slot: Slot,
        block_no: BlockNumber,
        prev_hash: PrevHash,
        is_boundary: bool,
        issuer: u64,
        body: &[u8],
    ) -> Self {
        let inner = HeaderInner {
            slot,
            block_no,
            prev_hash,
            is_boundary,
            issuer,
            body_size: body.len() as u32,
            body_root: BlockHash::hash_bytes(body),
        };
        let hash = BlockHash::hash_borsh(&inner);
        BlockHeader { inner, hash }
    }

    /// Recomputes the cached hash. Must be called after deserializing.
    pub fn init(&mut self) {
        self.hash = BlockHash::hash_borsh(&self.inner);
    }

    pub fn hash(&self) -> BlockHash {
        self.hash
    }

    pub fn slot(&self) -> Slot {
        self.inner.slot
    }

    pub fn block_no(&self) -> BlockNumber {
        self.inner.block_no
    }

    pub fn prev_hash(&self) -> PrevHash {
        self.inner.prev_hash
    }

    pub fn is_boundary(&self) -> bool {
        self.inner.is_boundary
    }

    pub fn issuer(&self) -> u64 {
        self.inner.issuer
    }

    pub fn body_size(&self) -> u32 {
        self.inner.body_size
    }

    pub fn body_root(&self) -> BlockHash {
        self.inner.body_root
    }

    pub fn point(&self) -> Point {
        Point::Block(self.inner.slot, self.hash)
    }

    pub fn tip(&self) -> Tip {
        Tip {
            point: self.point(),
            block_no: Some(self.inner.block_no),
            is_boundary: self.inner.is_boundary,
        }
    }

    /// Number of bytes this header occupies at the front of the serialized
    /// block.
    pub fn serialized_size(&self) -> usize {
        borsh::object_length(self).expect("in-memory serialization never fails")
    }

    /// Decodes a header from its serialized bytes and restores the hash.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlockDecodeError> {
        let mut header = BlockHeader::try_from_slice(bytes)?;
        header.init();
        Ok(header)
    }
}

/// A block: a header followed by an opaque body payload.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct Block {
    header: BlockHeader,
    body: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum BlockDecodeError {
    #[error("malformed block bytes: {0}")]
    Malformed(#[from] std::io::Error),
    #[error("body does not match the header's body root")]
    BodyMismatch,
}

impl Block {
    /// Assembles a block. The header must have been built over this body.
    pub fn new(header: BlockHeader, body: Vec<u8>) -> Self {
        debug_assert_eq!(header.body_root(), BlockHash::hash_bytes(&body));
        Block { header, body }
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    pub fn point(&self) -> Point {
        self.header.point()
    }

    /// Serializes the block for storage. The header occupies the leading
    /// `header.serialized_size()` bytes of the result.
    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("in-memory serialization never fails")
    }

    /// Decodes a stored block, restores the header hash and verifies the
    /// body against the header's body root.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlockDecodeError> {
        let mut block = Block::try_from_slice(bytes)?;
        block.header.init();
        if block.header.body_root() != BlockHash::hash_bytes(&block.body)
            || block.header.body_size() as usize != block.body.len()
        {
            return Err(BlockDecodeError::BodyMismatch);
        }
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Block {
        let body = crate::test_utils::random_body(512);
        let header = BlockHeader::new(7, 3, PrevHash::Genesis, false, 1, &body);
        Block::new(header, body)
    }

    #[test]
    fn bytes_round_trip() {
        let block = sample_block();
        let decoded = Block::from_bytes(&block.to_bytes()).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.hash(), block.hash());
    }

    #[test]
    fn header_prefix_of_block_bytes() {
        let block = sample_block();
        let bytes = block.to_bytes();
        let header_len = block.header().serialized_size();
        let header = BlockHeader::from_bytes(&bytes[..header_len]).unwrap();
        assert_eq!(&header, block.header());
    }

    #[test]
    fn tampered_body_detected() {
        let block = sample_block();
        let mut bytes = block.to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(Block::from_bytes(&bytes).is_err());
    }
}
