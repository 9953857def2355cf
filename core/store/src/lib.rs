//! The node's three storage layers and the opener tying them together.
//!
//! - [`immutable::ImmutableDb`]: append-only chunked log of the settled
//!   chain prefix.
//! - [`volatile::VolatileDb`]: pool of recent blocks that are not yet
//!   known to be either immutable or garbage.
//! - [`ledger::LedgerDb`]: in-memory window of ledger states plus disk
//!   snapshots for fast restarts.
//!
//! [`StoreOpener`] owns the database root: the network marker, the
//! clean-shutdown marker, the advisory lock, and the validation policy
//! applied when the layers are opened.

use std::io;
use std::path::{Path, PathBuf};

use weft_primitives::{Block, BlockHeader};

pub mod immutable;
pub mod ledger;
pub mod metrics;
pub mod opener;
pub mod volatile;

pub use immutable::ImmutableDb;
pub use ledger::{DigestRules, LedgerDb, LedgerError, LedgerRules, LedgerState, SnapshotStore};
pub use opener::{NodeStorage, StoreOpener, StoreOpenerError};
pub use volatile::VolatileDb;

/// Storage failures. Both variants are fatal to the owning database
/// handle: the caller must close and reopen with validation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The filesystem failed underneath us (disk full, permissions,
    /// hardware).
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Data we know we wrote failed to read back consistently.
    #[error("database corruption in {path}: {reason}")]
    Corruption { path: PathBuf, reason: String },
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io { path: path.into(), source }
    }

    pub fn corruption(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        StoreError::Corruption { path: path.into(), reason: reason.into() }
    }
}

/// Which part of a stored block a consumer wants.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockComponent {
    Block,
    Header,
    /// The raw serialized bytes as stored on disk.
    Bytes,
    /// The on-disk size in bytes.
    Size,
}

/// A materialized [`BlockComponent`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ComponentValue {
    Block(Block),
    Header(BlockHeader),
    Bytes(Vec<u8>),
    Size(u32),
}

impl ComponentValue {
    pub fn into_block(self) -> Option<Block> {
        match self {
            ComponentValue::Block(block) => Some(block),
            _ => None,
        }
    }

    pub fn into_header(self) -> Option<BlockHeader> {
        match self {
            ComponentValue::Header(header) => Some(header),
            _ => None,
        }
    }
}

/// How much work to spend validating the immutable layer at open.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ImmutableValidation {
    /// Re-parse and re-hash every chunk.
    ValidateAllChunks,
    /// Validate only the most recent chunk; trust the rest. Only honored
    /// after a clean shutdown.
    ValidateMostRecentChunk,
}

/// How much work to spend validating the volatile layer at open.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum VolatileValidation {
    /// Decode every block fully, body hash included.
    ValidateAll,
    /// Parse segment framing and headers only. Only honored after a clean
    /// shutdown.
    NoValidation,
}

/// Storage layer configuration.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Slots covered by one immutable chunk file (one chunk per epoch).
    pub slots_per_chunk: u64,
    /// Blocks per volatile segment file before rotating to a new one.
    pub max_blocks_per_file: u32,
    /// Ledger snapshots kept on disk. The minimum of two guards against a
    /// crash mid-write of the newest.
    pub snapshot_retention: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig { slots_per_chunk: 21_600, max_blocks_per_file: 1_000, snapshot_retention: 2 }
    }
}

pub(crate) fn io_err(path: &Path, source: io::Error) -> StoreError {
    StoreError::io(path.to_path_buf(), source)
}
