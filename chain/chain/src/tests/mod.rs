//! Scenario tests for the chain database.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use weft_primitives::test_utils::init_test_logger;
use weft_primitives::{Block, BlockHash, Clock, FakeClock, Point, Tip};
use weft_store::ledger::{DigestRules, LedgerError, LedgerRules, LedgerState};
use weft_store::{ImmutableValidation, StoreConfig, VolatileValidation};

use crate::types::{ChainPreference, LongestChain};
use crate::{ChainConfig, ChainDb};

mod simple_chain;

/// Ledger rules that fail for an explicit set of blocks; everything else
/// behaves like [`DigestRules`].
pub(crate) struct RejectRules {
    inner: DigestRules,
    rejected: Mutex<HashSet<BlockHash>>,
}

impl RejectRules {
    pub fn new() -> Arc<Self> {
        Arc::new(RejectRules { inner: DigestRules, rejected: Mutex::new(HashSet::new()) })
    }

    pub fn reject(&self, hash: BlockHash) {
        self.rejected.lock().insert(hash);
    }
}

impl LedgerRules for RejectRules {
    fn apply_block(&self, state: &LedgerState, block: &Block) -> Result<LedgerState, LedgerError> {
        if self.rejected.lock().contains(&block.hash()) {
            return Err(LedgerError::Rejected {
                block: block.point(),
                reason: "rejected by test rules".to_string(),
            });
        }
        self.inner.apply_block(state, block)
    }
}

/// Preference that favors a designated tip among equal-length chains;
/// longer chains still win outright.
pub(crate) struct PreferTip(pub BlockHash);

impl ChainPreference for PreferTip {
    fn prefer_candidate(&self, current: &Tip, candidate: &Tip) -> bool {
        if candidate.block_no != current.block_no {
            return candidate.block_no > current.block_no;
        }
        candidate.hash() == Some(self.0) && current.hash() != Some(self.0)
    }

    fn compare_candidates(&self, a: &Tip, b: &Tip) -> Ordering {
        a.block_no
            .cmp(&b.block_no)
            .then_with(|| (a.hash() == Some(self.0)).cmp(&(b.hash() == Some(self.0))))
    }
}

pub(crate) fn test_config(k: u64) -> ChainConfig {
    ChainConfig {
        security_param: k,
        clock_skew_slots: 2,
        queue_capacity: 8,
        gc_delay: Duration::ZERO,
        // Tests drive the settling pipeline explicitly.
        copy_interval: Duration::from_secs(3_600),
        genesis_timestamp: Duration::from_secs(1_000),
        slot_duration: Duration::from_secs(1),
        network_magic: 7,
        store: StoreConfig { slots_per_chunk: 10, max_blocks_per_file: 4, snapshot_retention: 2 },
    }
}

pub(crate) struct TestEnv {
    // The database must shut down before the directory disappears.
    pub db: ChainDb,
    pub dir: tempfile::TempDir,
    pub config: ChainConfig,
    pub clock: FakeClock,
    pub rules: Arc<RejectRules>,
}

impl TestEnv {
    /// Fresh database with the wall clock parked at slot 1000, so blocks
    /// in the low slots are safely in the past.
    pub fn new(k: u64) -> TestEnv {
        Self::with_preference(k, Arc::new(LongestChain))
    }

    pub fn with_preference(k: u64, preference: Arc<dyn ChainPreference>) -> TestEnv {
        init_test_logger();
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(k);
        let clock = FakeClock::new(config.genesis_timestamp + Duration::from_secs(1_000));
        let rules = RejectRules::new();
        let db = open_db(dir.path(), config.clone(), clock.clock(), rules.clone(), preference);
        TestEnv { dir, config, clock, rules, db }
    }

    /// Adds a block and waits for the whole pipeline, returning the
    /// resulting tip.
    pub fn add(&self, block: &Block) -> Point {
        let mut promise = self.db.add_block(block.clone());
        assert!(promise.written_to_disk().unwrap(), "block {} was rejected", block.point());
        promise.processed().unwrap()
    }

    /// Adds a block expecting a pre-queue rejection; returns the resolved
    /// promise pair.
    pub fn add_rejected(&self, block: &Block) -> (bool, Point) {
        let mut promise = self.db.add_block(block.clone());
        let written = promise.written_to_disk().unwrap();
        let tip = promise.processed().unwrap();
        (written, tip)
    }

    /// Drops and reopens the database on the same directory.
    pub fn reopen(self) -> TestEnv {
        let TestEnv { dir, config, clock, rules, db } = self;
        db.close();
        drop(db);
        let db = open_db(
            dir.path(),
            config.clone(),
            clock.clock(),
            rules.clone(),
            Arc::new(LongestChain),
        );
        TestEnv { dir, config, clock, rules, db }
    }
}

pub(crate) fn open_db(
    root: &std::path::Path,
    config: ChainConfig,
    clock: Clock,
    rules: Arc<RejectRules>,
    preference: Arc<dyn ChainPreference>,
) -> ChainDb {
    ChainDb::open(
        root,
        config,
        clock,
        rules,
        preference,
        (ImmutableValidation::ValidateAllChunks, VolatileValidation::ValidateAll),
    )
    .unwrap()
}

/// Polls until the tip reaches `expected` or the timeout passes; the
/// worker ticks on its own schedule.
pub(crate) fn wait_for_tip(db: &ChainDb, expected: Point, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if db.get_tip_point() == expected {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    db.get_tip_point() == expected
}
