//! Ledger states for the rewindable suffix of the chain, plus disk
//! snapshots for fast restarts.
//!
//! The in-memory window holds one state per block over the last
//! `security_param` blocks (plus the state at the anchor), each state
//! reachable from its predecessor by applying exactly one block through
//! [`LedgerRules`]. Snapshots persist the anchor state; restoring replays
//! forward from the newest usable snapshot through the immutable store.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use borsh::{BorshDeserialize, BorshSerialize};

use weft_primitives::{Block, BlockHash, BlockNumber, Point, Slot};

use crate::immutable::{ImmutableDb, StreamFrom};
use crate::{BlockComponent, ComponentValue, StoreError, io_err, metrics};

/// The ledger state after applying some prefix of the chain.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct LedgerState {
    /// The block this state is the result of; `Origin` for genesis.
    pub tip: Point,
    pub block_no: Option<BlockNumber>,
    pub blocks_applied: u64,
    /// Running digest folded over every applied block.
    pub digest: BlockHash,
}

impl LedgerState {
    pub fn genesis() -> Self {
        LedgerState {
            tip: Point::Origin,
            block_no: None,
            blocks_applied: 0,
            digest: BlockHash::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("block {block} does not extend ledger tip {tip}")]
    DoesNotExtend { block: Point, tip: Point },
    #[error("block {block} has number {got}, ledger expects {want}")]
    WrongBlockNumber { block: Point, got: BlockNumber, want: BlockNumber },
    #[error("block {block} rejected: {reason}")]
    Rejected { block: Point, reason: String },
    /// The requested rewind target is older than the oldest retained
    /// state.
    #[error("point {0} is older than the ledger window")]
    PointTooOld(Point),
}

/// The ledger transition function and protocol tick, supplied by the
/// consensus layer.
pub trait LedgerRules: Send + Sync {
    fn apply_block(&self, state: &LedgerState, block: &Block) -> Result<LedgerState, LedgerError>;

    /// Advances time-dependent protocol state without applying a block.
    fn tick(&self, state: &LedgerState, _slot: Slot) -> LedgerState {
        state.clone()
    }
}

/// Default rules: check the parent link and block number, fold the block
/// into the running digest.
#[derive(Clone, Copy, Debug, Default)]
pub struct DigestRules;

impl LedgerRules for DigestRules {
    fn apply_block(&self, state: &LedgerState, block: &Block) -> Result<LedgerState, LedgerError> {
        let header = block.header();
        if !header.prev_hash().points_at(&state.tip) {
            return Err(LedgerError::DoesNotExtend { block: header.point(), tip: state.tip });
        }
        let want = state.block_no.map_or(0, |n| n + 1);
        if header.block_no() != want {
            return Err(LedgerError::WrongBlockNumber {
                block: header.point(),
                got: header.block_no(),
                want,
            });
        }
        let mut folded = Vec::with_capacity(64 + block.body().len());
        folded.extend_from_slice(state.digest.as_bytes());
        folded.extend_from_slice(header.hash().as_bytes());
        folded.extend_from_slice(block.body());
        Ok(LedgerState {
            tip: header.point(),
            block_no: Some(header.block_no()),
            blocks_applied: state.blocks_applied + 1,
            digest: BlockHash::hash_bytes(&folded),
        })
    }
}

/// In-memory window of ledger states, newest last.
#[derive(Clone, Debug)]
pub struct LedgerDb {
    states: VecDeque<LedgerState>,
    capacity: usize,
}

impl LedgerDb {
    /// Window seeded with the genesis state, able to rewind
    /// `security_param` blocks.
    pub fn genesis(security_param: u64) -> Self {
        Self::from_state(LedgerState::genesis(), security_param)
    }

    pub fn from_state(state: LedgerState, security_param: u64) -> Self {
        let capacity = security_param as usize + 1;
        let mut states = VecDeque::with_capacity(capacity);
        states.push_back(state);
        LedgerDb { states, capacity }
    }

    pub fn tip_state(&self) -> &LedgerState {
        self.states.back().expect("window never empty")
    }

    pub fn tip_point(&self) -> Point {
        self.tip_state().tip
    }

    /// The oldest retained state; what snapshots persist.
    pub fn anchor_state(&self) -> &LedgerState {
        self.states.front().expect("window never empty")
    }

    /// Number of retained states; at least one, at most
    /// `security_param + 1`.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Applies `block` on top of the tip state. On success the window
    /// advances (dropping the oldest state if at capacity); on failure it
    /// is untouched.
    pub fn push(&mut self, rules: &dyn LedgerRules, block: &Block) -> Result<(), LedgerError> {
        let next = rules.apply_block(self.tip_state(), block)?;
        self.states.push_back(next);
        while self.states.len() > self.capacity {
            self.states.pop_front();
        }
        Ok(())
    }

    /// A copy of the window truncated so that `point` is the tip.
    pub fn rewind(&self, point: &Point) -> Result<LedgerDb, LedgerError> {
        let index = self
            .states
            .iter()
            .rposition(|state| state.tip == *point)
            .ok_or(LedgerError::PointTooOld(*point))?;
        let states: VecDeque<LedgerState> =
            self.states.iter().take(index + 1).cloned().collect();
        Ok(LedgerDb { states, capacity: self.capacity })
    }

    /// Persists the anchor state. Returns the snapshot path, or `None`
    /// when the anchor is the genesis state (nothing worth writing).
    pub fn snapshot(&self, store: &SnapshotStore) -> Result<Option<PathBuf>, StoreError> {
        store.write(self.anchor_state())
    }
}

/// A snapshot on disk, identified by the slot and hash of its tip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotId {
    pub slot: Slot,
    pub hash: BlockHash,
    pub path: PathBuf,
}

/// The `ledger/` directory: atomically written, pruned snapshots.
pub struct SnapshotStore {
    dir: PathBuf,
    retention: usize,
}

impl SnapshotStore {
    /// Minimum snapshots kept; one in-flight rewrite must never leave us
    /// with nothing usable.
    pub const MIN_RETENTION: usize = 2;

    pub fn open(dir: &Path, retention: usize) -> Result<Self, StoreError> {
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        Ok(SnapshotStore {
            dir: dir.to_path_buf(),
            retention: retention.max(Self::MIN_RETENTION),
        })
    }

    /// Writes `state` as a snapshot via temp-file-then-rename, then prunes
    /// all but the newest `retention` snapshots.
    pub fn write(&self, state: &LedgerState) -> Result<Option<PathBuf>, StoreError> {
        let Point::Block(slot, hash) = state.tip else { return Ok(None) };
        let path = self.dir.join(format!("{slot}_{hash}"));
        if path.exists() {
            return Ok(Some(path));
        }
        let tmp = self.dir.join(format!("{slot}_{hash}.tmp"));
        {
            let mut file = File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
            let bytes = borsh::to_vec(state).map_err(|e| io_err(&tmp, e))?;
            file.write_all(&bytes).map_err(|e| io_err(&tmp, e))?;
            file.sync_data().map_err(|e| io_err(&tmp, e))?;
        }
        fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
        metrics::LEDGER_SNAPSHOTS_WRITTEN_TOTAL.inc();
        tracing::info!(target: "store", snapshot = %state.tip, "wrote ledger snapshot");
        self.prune()?;
        Ok(Some(path))
    }

    /// Snapshots on disk, oldest first.
    pub fn list(&self) -> Result<Vec<SnapshotId>, StoreError> {
        let mut snapshots = Vec::new();
        for dir_entry in fs::read_dir(&self.dir).map_err(|e| io_err(&self.dir, e))? {
            let dir_entry = dir_entry.map_err(|e| io_err(&self.dir, e))?;
            let name = dir_entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(".tmp") {
                // Leftover from an interrupted write.
                let _ = fs::remove_file(dir_entry.path());
                continue;
            }
            let Some((slot, hash)) = name.split_once('_') else { continue };
            let (Ok(slot), Ok(hash)) = (slot.parse::<Slot>(), hash.parse::<BlockHash>()) else {
                continue;
            };
            snapshots.push(SnapshotId { slot, hash, path: dir_entry.path() });
        }
        snapshots.sort_by_key(|s| (s.slot, s.hash));
        Ok(snapshots)
    }

    pub fn read(&self, id: &SnapshotId) -> Result<LedgerState, StoreError> {
        let bytes = fs::read(&id.path).map_err(|e| io_err(&id.path, e))?;
        let state = LedgerState::try_from_slice(&bytes)
            .map_err(|e| StoreError::corruption(&id.path, format!("snapshot: {e}")))?;
        if state.tip != Point::Block(id.slot, id.hash) {
            return Err(StoreError::corruption(&id.path, "snapshot content does not match its name"));
        }
        Ok(state)
    }

    pub fn delete(&self, id: &SnapshotId) -> Result<(), StoreError> {
        match fs::remove_file(&id.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&id.path, e)),
        }
    }

    fn prune(&self) -> Result<(), StoreError> {
        let snapshots = self.list()?;
        if snapshots.len() <= self.retention {
            return Ok(());
        }
        let drop_count = snapshots.len() - self.retention;
        for stale in &snapshots[..drop_count] {
            tracing::debug!(target: "store", slot = stale.slot, "pruning old ledger snapshot");
            self.delete(stale)?;
        }
        Ok(())
    }
}

/// Rebuilds the ledger window: restores the newest usable snapshot and
/// replays blocks from the immutable store up to its tip. Snapshots that
/// fail to read or replay are deleted and the next older one is tried;
/// with none left the replay starts from genesis.
pub fn restore(
    snapshots: &SnapshotStore,
    immutable: &ImmutableDb,
    rules: &dyn LedgerRules,
    security_param: u64,
) -> Result<LedgerDb, StoreError> {
    let immutable_tip = immutable.tip();
    let mut candidates = snapshots.list()?;
    while let Some(id) = candidates.pop() {
        let state = match snapshots.read(&id) {
            Ok(state) => state,
            Err(error) => {
                tracing::warn!(target: "store", snapshot = ?id.path, %error, "unreadable snapshot; deleting");
                snapshots.delete(&id)?;
                continue;
            }
        };
        if !immutable.contains(&state.tip)? {
            tracing::warn!(target: "store", snapshot = %state.tip, "snapshot not on the immutable chain; deleting");
            snapshots.delete(&id)?;
            continue;
        }
        let mut db = LedgerDb::from_state(state, security_param);
        match replay(&mut db, immutable, rules, immutable_tip.point)? {
            Ok(()) => {
                tracing::info!(target: "store", from = %db.anchor_state().tip, tip = %db.tip_point(), "restored ledger from snapshot");
                return Ok(db);
            }
            Err(error) => {
                tracing::warn!(target: "store", snapshot = ?id.path, %error, "snapshot failed to replay; deleting");
                snapshots.delete(&id)?;
            }
        }
    }

    let mut db = LedgerDb::genesis(security_param);
    match replay(&mut db, immutable, rules, immutable_tip.point)? {
        Ok(()) => Ok(db),
        // The immutable store only holds blocks that validated once, so a
        // genesis replay failure means the store and rules disagree.
        Err(error) => Err(StoreError::corruption(
            immutable.dir(),
            format!("immutable chain does not replay from genesis: {error}"),
        )),
    }
}

/// Applies every immutable block after the window's tip up to `to`.
fn replay(
    db: &mut LedgerDb,
    immutable: &ImmutableDb,
    rules: &dyn LedgerRules,
    to: Point,
) -> Result<Result<(), LedgerError>, StoreError> {
    if to.is_origin() || to == db.tip_point() {
        return Ok(Ok(()));
    }
    let from = StreamFrom::Exclusive(db.tip_point());
    let stream = match immutable.stream(from, to, BlockComponent::Block) {
        Ok(stream) => stream,
        Err(crate::immutable::StreamError::Store(e)) => return Err(e),
        Err(error) => {
            return Ok(Err(LedgerError::Rejected {
                block: to,
                reason: format!("replay stream: {error}"),
            }));
        }
    };
    let mut replayed = 0u64;
    for item in stream {
        let (_, value) = item?;
        let ComponentValue::Block(block) = value else { continue };
        if let Err(error) = db.push(rules, &block) {
            return Ok(Err(error));
        }
        replayed += 1;
    }
    tracing::debug!(target: "store", replayed, tip = %db.tip_point(), "replayed immutable blocks");
    Ok(Ok(()))
}
