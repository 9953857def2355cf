//! Helpers shared by tests across the workspace.

use crate::block::{Block, BlockHeader, PrevHash};
use crate::types::{BlockNumber, Slot, Tip};

/// Installs a global tracing subscriber honoring `RUST_LOG`. Safe to call
/// from every test; only the first call wins.
pub fn init_test_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Builder for chained test blocks.
///
/// ```ignore
/// let genesis_child = TestBlockBuilder::from_tip(&Tip::genesis()).slot(1).build();
/// let next = TestBlockBuilder::new(genesis_child.header()).build();
/// let fork = TestBlockBuilder::new(parent.header()).issuer(2).build();
/// ```
pub struct TestBlockBuilder {
    prev_hash: PrevHash,
    slot: Slot,
    block_no: BlockNumber,
    is_boundary: bool,
    issuer: u64,
    body: Vec<u8>,
}

impl TestBlockBuilder {
    /// Child of the given header, one slot and one block number ahead.
    pub fn new(parent: &BlockHeader) -> Self {
        TestBlockBuilder {
            prev_hash: PrevHash::Block(parent.hash()),
            slot: parent.slot() + 1,
            block_no: parent.block_no() + 1,
            is_boundary: false,
            issuer: 0,
            body: Vec::new(),
        }
    }

    /// Block extending an arbitrary tip (use `Tip::genesis()` for the
    /// first block of a chain).
    pub fn from_tip(tip: &Tip) -> Self {
        TestBlockBuilder {
            prev_hash: tip.hash().map_or(PrevHash::Genesis, PrevHash::Block),
            slot: tip.slot().map_or(1, |s| s + 1),
            block_no: tip.next_block_no(),
            is_boundary: false,
            issuer: 0,
            body: Vec::new(),
        }
    }

    pub fn slot(mut self, slot: Slot) -> Self {
        self.slot = slot;
        self
    }

    pub fn issuer(mut self, issuer: u64) -> Self {
        self.issuer = issuer;
        self
    }

    pub fn boundary(mut self) -> Self {
        self.is_boundary = true;
        self.body = Vec::new();
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn build(self) -> Block {
        let header = BlockHeader::new(
            self.slot,
            self.block_no,
            self.prev_hash,
            self.is_boundary,
            self.issuer,
            &self.body,
        );
        Block::new(header, self.body)
    }
}

/// Random block body for size-sensitive tests.
pub fn random_body(len: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut body = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut body);
    body
}

/// Builds a linear chain of `n` blocks on top of `tip`, one slot apart.
pub fn build_chain_on(tip: &Tip, n: usize) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(n);
    let mut tip = *tip;
    for _ in 0..n {
        let block = TestBlockBuilder::from_tip(&tip).build();
        tip = block.header().tip();
        blocks.push(block);
    }
    blocks
}
