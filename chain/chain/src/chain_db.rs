//! The chain database handle and the add-block worker behind it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};

use weft_primitives::{
    AnchoredFragment, Block, BlockHash, BlockHeader, BlockNumber, Clock, Point, Slot, SlotClock,
    Tip,
};
use weft_store::ledger::{LedgerDb, LedgerRules, LedgerState};
use weft_store::{
    BlockComponent, ComponentValue, ImmutableValidation, NodeStorage, StoreError, StoreOpener,
    VolatileValidation,
};

use crate::background;
use crate::error::Error;
use crate::iterators::{self, ChainIterator};
use crate::queue::{AddBlockPromise, BlockToAdd, promise_pair};
use crate::readers::{Reader, ReaderPos};
use crate::types::{ChainPreference, InvalidBlockReason, InvalidBlocks, WithFingerprint};
use crate::{ChainConfig, metrics, selection};

/// The invariant-carrying state behind the chain lock. Every mutation
/// that touches the chain (fragment, ledger, reader positions) happens
/// under one acquisition so observers never see a mixed view.
pub(crate) struct ChainState {
    pub current: AnchoredFragment,
    pub ledger: LedgerDb,
    pub invalid: InvalidBlocks,
    pub future: HashMap<BlockHash, BlockHeader>,
    pub readers: HashMap<u64, ReaderPos>,
    pub next_reader_id: u64,
}

pub(crate) struct ChainDbInner {
    pub config: ChainConfig,
    pub clock: Clock,
    pub slot_clock: SlotClock,
    pub rules: Arc<dyn LedgerRules>,
    pub preference: Arc<dyn ChainPreference>,
    pub storage: NodeStorage,
    pub chain: Mutex<ChainState>,
    /// Signaled on every chain mutation and on close; blocking readers
    /// wait here.
    pub chain_changed: Condvar,
    /// Mutual exclusion for the copy-to-immutable task (with itself).
    pub copy_lock: Mutex<()>,
    closed: AtomicBool,
}

impl ChainDbInner {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Flips the handle to closed and wakes everything blocked on the
    /// chain. Used both by `close()` and by workers hitting fatal errors.
    pub fn begin_close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.chain_changed.notify_all();
    }

    pub fn now_slot(&self) -> Slot {
        self.slot_clock.current_slot(&self.clock)
    }

    pub fn head(&self) -> Tip {
        self.chain.lock().current.head()
    }

    /// Looks a chain block up across both stores and materializes the
    /// requested component.
    pub fn fetch_component(
        &self,
        point: &Point,
        component: BlockComponent,
    ) -> Result<Option<ComponentValue>, StoreError> {
        if let Point::Block(_, hash) = point {
            if let Some(block) = self.storage.volatile.get(hash)? {
                return Ok(Some(component_of_block(&block, component)));
            }
        }
        self.storage.immutable.get_component(point, component)
    }
}

/// Materializes a component from an in-memory block.
pub(crate) fn component_of_block(block: &Block, component: BlockComponent) -> ComponentValue {
    match component {
        BlockComponent::Block => ComponentValue::Block(block.clone()),
        BlockComponent::Header => ComponentValue::Header(block.header().clone()),
        BlockComponent::Bytes => ComponentValue::Bytes(block.to_bytes()),
        BlockComponent::Size => ComponentValue::Size(block.to_bytes().len() as u32),
    }
}

/// The chain database.
///
/// Owns the storage layers and the three background workers. All methods
/// are callable from any thread; mutations are serialized through the
/// add-block worker.
pub struct ChainDb {
    inner: Arc<ChainDbInner>,
    queue_tx: Sender<BlockToAdd>,
    shutdown_tx: Sender<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ChainDb {
    /// Opens the database root and brings the chain back: restores the
    /// ledger from its newest usable snapshot, replays the immutable
    /// chain, and re-runs chain selection over whatever the volatile pool
    /// still holds.
    pub fn open(
        root: &Path,
        config: ChainConfig,
        clock: Clock,
        rules: Arc<dyn LedgerRules>,
        preference: Arc<dyn ChainPreference>,
        validation: (ImmutableValidation, VolatileValidation),
    ) -> Result<ChainDb, Error> {
        config.validate()?;
        let storage = StoreOpener::new(root, config.store.clone(), config.network_magic)
            .with_validation(validation.0, validation.1)
            .open()?;
        let ledger = weft_store::ledger::restore(
            &storage.snapshots,
            &storage.immutable,
            rules.as_ref(),
            config.security_param,
        )?;
        let current = AnchoredFragment::new(storage.immutable.tip());
        debug_assert_eq!(ledger.tip_point(), current.anchor_point());

        let slot_clock =
            SlotClock { genesis: config.genesis_timestamp, slot_duration: config.slot_duration };
        tracing::info!(
            target: "chain",
            security_param = config.security_param,
            clock_skew_slots = config.clock_skew_slots,
            immutable_tip = %current.anchor_point(),
            "opening chain database",
        );

        let inner = Arc::new(ChainDbInner {
            slot_clock,
            rules,
            preference,
            storage,
            chain: Mutex::new(ChainState {
                current,
                ledger,
                invalid: InvalidBlocks::default(),
                future: HashMap::new(),
                readers: HashMap::new(),
                next_reader_id: 0,
            }),
            chain_changed: Condvar::new(),
            copy_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            clock,
            config,
        });

        // Re-adopt whatever survived in the volatile pool before anyone
        // can observe the chain.
        selection::chain_selection(&inner)?;

        let (queue_tx, queue_rx) = crossbeam_channel::bounded(inner.config.queue_capacity);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        let (gc_tx, gc_rx) = crossbeam_channel::unbounded();

        let mut workers = Vec::with_capacity(3);
        let worker_inner = inner.clone();
        workers.push(
            std::thread::Builder::new()
                .name("chain-worker".to_string())
                .spawn(move || worker_loop(worker_inner, queue_rx))
                .expect("spawning chain worker"),
        );
        let copy_inner = inner.clone();
        workers.push(
            std::thread::Builder::new()
                .name("copy-to-immutable".to_string())
                .spawn(move || background::copy_loop(copy_inner, shutdown_rx, gc_tx))
                .expect("spawning copy task"),
        );
        let gc_inner = inner.clone();
        workers.push(
            std::thread::Builder::new()
                .name("volatile-gc".to_string())
                .spawn(move || background::gc_loop(gc_inner, gc_rx))
                .expect("spawning gc task"),
        );

        Ok(ChainDb { inner, queue_tx, shutdown_tx, workers: Mutex::new(workers) })
    }

    /// Hands a block to the pipeline. Cheap filters run inline; everything
    /// else happens on the worker. The returned promises resolve in order:
    /// durability first, then the post-selection tip.
    pub fn add_block(&self, block: Block) -> AddBlockPromise {
        if self.inner.is_closed() {
            return closed_promise();
        }
        let header = block.header();
        let now_slot = self.inner.now_slot();

        {
            let mut chain = self.inner.chain.lock();
            let tip = chain.current.head().point;

            if header.slot() > now_slot + self.inner.config.clock_skew_slots {
                tracing::warn!(
                    target: "chain",
                    block = %header.point(),
                    now_slot,
                    "InFutureExceedsClockSkew: rejecting and marking invalid",
                );
                if chain.invalid.insert(
                    header.hash(),
                    InvalidBlockReason::InFutureExceedsClockSkew,
                    header.slot(),
                ) {
                    metrics::INVALID_BLOCKS_TOTAL.inc();
                }
                metrics::BLOCKS_REJECTED_TOTAL.inc();
                return AddBlockPromise::resolved(false, tip);
            }

            if let Some(anchor_no) = chain.current.anchor().block_no {
                if header.block_no() <= anchor_no {
                    tracing::debug!(
                        target: "chain",
                        block = %header.point(),
                        block_no = header.block_no(),
                        anchor_no,
                        "IgnoreBlockOlderThanK",
                    );
                    metrics::BLOCKS_REJECTED_TOTAL.inc();
                    return AddBlockPromise::resolved(false, tip);
                }
            }

            if chain.invalid.contains(&header.hash()) {
                tracing::debug!(target: "chain", block = %header.point(), "IgnoreInvalidBlock");
                metrics::BLOCKS_REJECTED_TOTAL.inc();
                return AddBlockPromise::resolved(false, tip);
            }
        }

        if self.inner.storage.volatile.contains(&header.hash()) {
            tracing::debug!(target: "chain", block = %header.point(), "IgnoreBlockAlreadyInVolDB");
            // The block is on disk from the earlier add.
            return AddBlockPromise::resolved(true, self.inner.head().point);
        }

        let (to_add, promise) = promise_pair(block);
        metrics::BLOCKS_ADDED_TOTAL.inc();
        // A full queue blocks the producer; a dead worker resolves the
        // promises as closed via the dropped senders.
        let _ = self.queue_tx.send(to_add);
        promise
    }

    /// Snapshot of the in-memory fragment: the last `<= k` headers (more
    /// only transiently, while the copy task is behind).
    pub fn get_current_chain(&self) -> AnchoredFragment {
        self.inner.chain.lock().current.clone()
    }

    pub fn get_current_ledger(&self) -> LedgerState {
        self.inner.chain.lock().ledger.tip_state().clone()
    }

    pub fn get_tip_point(&self) -> Point {
        self.inner.head().point
    }

    pub fn get_tip_block_no(&self) -> Option<BlockNumber> {
        self.inner.head().block_no
    }

    pub fn get_tip_header(&self) -> Result<Option<BlockHeader>, Error> {
        {
            let chain = self.inner.chain.lock();
            if let Some(header) = chain.current.headers().next_back() {
                return Ok(Some(header.clone()));
            }
        }
        let tip = self.inner.storage.immutable.tip();
        if tip.point.is_origin() {
            return Ok(None);
        }
        Ok(self.inner.storage.immutable.get_header(&tip.point)?)
    }

    /// Looks a block up across both stores.
    pub fn get_block(&self, point: &Point) -> Result<Option<Block>, Error> {
        if self.inner.is_closed() {
            return Err(Error::DbClosed);
        }
        match self.inner.fetch_component(point, BlockComponent::Block)? {
            Some(ComponentValue::Block(block)) => Ok(Some(block)),
            Some(_) => unreachable!("asked for a block"),
            None => Ok(None),
        }
    }

    /// Whether the block at `point` is already present in either store.
    pub fn is_fetched(&self, point: &Point) -> bool {
        self.inner.storage.volatile.contains_point(point)
            || self.inner.storage.immutable.contains(point).unwrap_or(false)
    }

    /// Standalone predicate for the block-fetch decider.
    pub fn fetched_predicate(&self) -> impl Fn(&Point) -> bool + Send + Sync + 'static + use<> {
        let inner = self.inner.clone();
        move |point| {
            // An I/O failure reads as "not fetched"; the decider will just
            // request the block again.
            inner.storage.volatile.contains_point(point)
                || inner.storage.immutable.contains(point).unwrap_or(false)
        }
    }

    /// Range iterator across both stores; see the module docs of
    /// [`crate::iterators`].
    pub fn stream(
        &self,
        from: Point,
        to: Point,
        component: BlockComponent,
    ) -> Result<ChainIterator, Error> {
        iterators::stream(self.inner.clone(), from, to, component)
    }

    /// A reader following the current chain through rolls forward and
    /// backward; see [`crate::readers`].
    pub fn new_reader(&self, component: BlockComponent) -> Result<Reader, Error> {
        Reader::register(self.inner.clone(), component)
    }

    /// The invalid-block set with its fingerprint, for upstream peers'
    /// rejection caches.
    pub fn get_is_invalid_block(
        &self,
    ) -> WithFingerprint<HashMap<BlockHash, InvalidBlockReason>> {
        self.inner.chain.lock().invalid.snapshot()
    }

    /// Closes the handle: stops the workers, resolves in-flight promises
    /// as closed, writes a final ledger snapshot and the clean-shutdown
    /// marker. Layers shut in order volatile, ledger, immutable.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.chain_changed.notify_all();
        let _ = self.shutdown_tx.try_send(());
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
        // Volatile: every put was fsynced, nothing to flush. Ledger: keep
        // a fresh snapshot for the next restore. Immutable: flush the open
        // chunk.
        let anchor_state = self.inner.chain.lock().ledger.anchor_state().clone();
        if let Err(error) = self.inner.storage.snapshots.write(&anchor_state) {
            tracing::warn!(target: "chain", %error, "failed to write final ledger snapshot");
        }
        match self.inner.storage.immutable.sync() {
            Ok(()) => {
                if let Err(error) = self.inner.storage.mark_clean_shutdown() {
                    tracing::warn!(target: "chain", %error, "failed to write clean-shutdown marker");
                }
            }
            Err(error) => {
                // Without a clean flush the next open must validate.
                tracing::warn!(target: "chain", %error, "failed to flush immutable store on close");
            }
        }
        tracing::info!(target: "chain", "chain database closed");
    }

    /// Runs one copy-to-immutable cycle inline. Tests drive the settling
    /// pipeline with this instead of waiting for the background interval.
    #[cfg(test)]
    pub(crate) fn copy_to_immutable_now(&self) -> Result<usize, StoreError> {
        let (gc_tx, gc_rx) = crossbeam_channel::unbounded();
        let copied = background::copy_once(&self.inner, &gc_tx)?;
        drop(gc_tx);
        // Run the scheduled collection immediately rather than after
        // gc_delay.
        while let Ok(request) = gc_rx.try_recv() {
            self.inner.storage.volatile.garbage_collect(request.bound)?;
        }
        Ok(copied)
    }
}

impl Drop for ChainDb {
    fn drop(&mut self) {
        self.close();
    }
}

fn closed_promise() -> AddBlockPromise {
    let (_written_tx, written_rx) = oneshot::channel();
    let (_processed_tx, processed_rx) = oneshot::channel();
    AddBlockPromise::new(written_rx, processed_rx)
}

/// The single thread that serializes every chain mutation.
fn worker_loop(inner: Arc<ChainDbInner>, queue: Receiver<BlockToAdd>) {
    // Wake often enough to notice matured future blocks within a slot.
    let tick = (inner.config.slot_duration / 2).clamp(
        Duration::from_millis(10),
        Duration::from_secs(1),
    );
    loop {
        if inner.is_closed() {
            break;
        }
        match queue.recv_timeout(tick) {
            Ok(item) => {
                if let Err(error) = process_block(&inner, item) {
                    tracing::error!(target: "chain", %error, "fatal storage error; closing chain database");
                    inner.begin_close();
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if let Err(error) = process_matured_future_blocks(&inner) {
                    tracing::error!(target: "chain", %error, "fatal storage error; closing chain database");
                    inner.begin_close();
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::debug!(target: "chain", "add-block worker stopped");
}

fn process_block(inner: &ChainDbInner, item: BlockToAdd) -> Result<(), StoreError> {
    let BlockToAdd { block, written, processed } = item;
    let header = block.header().clone();

    inner.storage.volatile.put(&block)?;
    let _ = written.send(true);

    let now_slot = inner.now_slot();
    if header.slot() > now_slot {
        // Within the skew bound (the cutoff ran before enqueueing) but not
        // yet valid: park it until its slot arrives.
        let tip = {
            let mut chain = inner.chain.lock();
            chain.future.insert(header.hash(), header.clone());
            chain.current.head().point
        };
        tracing::debug!(target: "chain", block = %header.point(), now_slot, "block from the future; deferred");
        let _ = processed.send(tip);
        return Ok(());
    }

    selection::chain_selection(inner)?;
    process_matured_future_blocks(inner)?;
    let _ = processed.send(inner.head().point);
    Ok(())
}

/// Re-runs chain selection when deferred future blocks have reached their
/// slot.
fn process_matured_future_blocks(inner: &ChainDbInner) -> Result<(), StoreError> {
    let now_slot = inner.now_slot();
    let matured: Vec<BlockHash> = {
        let mut chain = inner.chain.lock();
        let matured: Vec<BlockHash> = chain
            .future
            .iter()
            .filter(|(_, header)| header.slot() <= now_slot)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in &matured {
            chain.future.remove(hash);
        }
        matured
    };
    if !matured.is_empty() {
        tracing::debug!(target: "chain", count = matured.len(), now_slot, "future blocks matured");
        selection::chain_selection(inner)?;
    }
    Ok(())
}
