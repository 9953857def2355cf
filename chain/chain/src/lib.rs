//! The chain database: accepts candidate blocks from the network, stores
//! them durably, selects the best chain, and serves block and header
//! streams to downstream consumers.
//!
//! One background worker serializes all chain mutations; a second copies
//! settled blocks into the immutable store; a third garbage-collects the
//! volatile pool. Readers and iterators observe the chain without ever
//! seeing a half-applied switch.

use std::time::Duration;

use weft_store::StoreConfig;

mod background;
mod chain_db;
mod error;
mod iterators;
mod metrics;
mod queue;
mod readers;
mod selection;
mod types;

#[cfg(test)]
mod tests;

pub use chain_db::ChainDb;
pub use error::Error;
pub use iterators::{ChainIterator, IteratorError};
pub use queue::AddBlockPromise;
pub use readers::{ChainUpdate, Reader};
pub use types::{
    ChainPreference, InvalidBlockReason, InvalidBlocks, LongestChain, WithFingerprint,
};

/// Chain-level configuration.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// The security parameter `k`: blocks deeper than this below the tip
    /// are immutable; no rollback may cross them.
    pub security_param: u64,
    /// How far ahead of the wall clock a block's slot may sit before the
    /// block is treated as invalid rather than merely early.
    pub clock_skew_slots: u64,
    /// Capacity of the add-block queue; producers block when it is full.
    pub queue_capacity: usize,
    /// Wall-clock delay between copying a block to the immutable store and
    /// collecting its slot from the volatile pool.
    pub gc_delay: Duration,
    /// How often the copy task looks for settled blocks.
    pub copy_interval: Duration,
    /// Wall-clock time of slot 0, since the unix epoch.
    pub genesis_timestamp: Duration,
    pub slot_duration: Duration,
    /// Network magic written into the database marker.
    pub network_magic: u32,
    pub store: StoreConfig,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            security_param: 2_160,
            clock_skew_slots: 2,
            queue_capacity: 64,
            gc_delay: Duration::from_secs(60),
            copy_interval: Duration::from_secs(1),
            genesis_timestamp: Duration::ZERO,
            slot_duration: Duration::from_secs(1),
            network_magic: 764_824_073,
            store: StoreConfig::default(),
        }
    }
}

impl ChainConfig {
    /// Rejects configurations that cannot work before any file is touched.
    pub fn validate(&self) -> Result<(), Error> {
        if self.security_param == 0 {
            return Err(Error::Config("security_param must be at least 1".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be at least 1".to_string()));
        }
        if self.slot_duration.is_zero() {
            return Err(Error::Config("slot_duration must be positive".to_string()));
        }
        if self.store.max_blocks_per_file == 0 {
            return Err(Error::Config("store.max_blocks_per_file must be at least 1".to_string()));
        }
        if self.store.slots_per_chunk == 0 {
            return Err(Error::Config("store.slots_per_chunk must be at least 1".to_string()));
        }
        if self.store.snapshot_retention < 2 {
            return Err(Error::Config("store.snapshot_retention must be at least 2".to_string()));
        }
        Ok(())
    }
}
