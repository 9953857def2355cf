//! Background maintenance: copying settled blocks into the immutable
//! store and, after a delay, collecting their slots from the volatile
//! pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use weft_primitives::{BlockHeader, Slot};
use weft_store::StoreError;
use weft_store::immutable::AppendError;

use crate::chain_db::ChainDbInner;
use crate::metrics;

/// A volatile collection scheduled to run once `due` has passed.
pub(crate) struct GcRequest {
    pub bound: Slot,
    pub due: Instant,
}

/// Periodically settles the chain suffix older than `k` into the
/// immutable store.
pub(crate) fn copy_loop(
    inner: Arc<ChainDbInner>,
    shutdown: Receiver<()>,
    gc_tx: Sender<GcRequest>,
) {
    loop {
        match shutdown.recv_timeout(inner.config.copy_interval) {
            Err(RecvTimeoutError::Timeout) => {
                if inner.is_closed() {
                    break;
                }
                if let Err(error) = copy_once(&inner, &gc_tx) {
                    tracing::error!(target: "chain", %error, "fatal storage error in copy task; closing chain database");
                    inner.begin_close();
                    break;
                }
            }
            _ => break,
        }
    }
    tracing::debug!(target: "chain", "copy-to-immutable task stopped");
}

/// One copy cycle: append every current-chain block deeper than `k` to
/// the immutable store, advance the fragment anchor past them, snapshot
/// the ledger anchor, and schedule a volatile collection.
pub(crate) fn copy_once(
    inner: &ChainDbInner,
    gc_tx: &Sender<GcRequest>,
) -> Result<usize, StoreError> {
    let _guard = inner.copy_lock.lock();
    let k = inner.config.security_param as usize;

    let to_copy: Vec<BlockHeader> = {
        let chain = inner.chain.lock();
        let len = chain.current.len();
        if len <= k {
            return Ok(0);
        }
        chain.current.headers().take(len - k).cloned().collect()
    };

    for header in &to_copy {
        let block = inner.storage.volatile.get(&header.hash())?.ok_or_else(|| {
            StoreError::corruption(
                inner.storage.root(),
                format!("settled chain block {} missing from the volatile pool", header.point()),
            )
        })?;
        inner.storage.immutable.append(&block).map_err(|e| match e {
            AppendError::Store(e) => e,
            // Linkage failures here mean the fragment and the immutable
            // store disagree, which only corruption explains.
            other => StoreError::corruption(inner.storage.root(), other.to_string()),
        })?;
    }
    inner.storage.immutable.sync()?;

    let anchor_state = {
        let mut chain = inner.chain.lock();
        chain.current.advance_anchor(to_copy.len());
        debug_assert_eq!(chain.current.anchor_point(), inner.storage.immutable.tip().point);
        chain.ledger.anchor_state().clone()
    };
    inner.storage.snapshots.write(&anchor_state)?;

    if let Some(bound) = inner.storage.immutable.tip().slot() {
        let _ = gc_tx.send(GcRequest { bound, due: Instant::now() + inner.config.gc_delay });
    }
    metrics::BLOCKS_COPIED_TOTAL.inc_by(to_copy.len() as u64);
    tracing::debug!(
        target: "chain",
        copied = to_copy.len(),
        immutable_tip = %inner.storage.immutable.tip().point,
        "copied settled blocks to the immutable store",
    );
    Ok(to_copy.len())
}

/// Runs scheduled volatile collections once their delay has passed.
pub(crate) fn gc_loop(inner: Arc<ChainDbInner>, requests: Receiver<GcRequest>) {
    loop {
        match requests.recv_timeout(Duration::from_millis(200)) {
            Ok(request) => {
                while let Some(wait) = request.due.checked_duration_since(Instant::now()) {
                    if wait.is_zero() || inner.is_closed() {
                        break;
                    }
                    std::thread::sleep(wait.min(Duration::from_millis(200)));
                }
                if inner.is_closed() {
                    break;
                }
                match inner.storage.volatile.garbage_collect(request.bound) {
                    Ok(removed) => {
                        if removed > 0 {
                            tracing::debug!(target: "gc", bound = request.bound, removed, "volatile collection done");
                        }
                    }
                    Err(error) => {
                        tracing::error!(target: "gc", %error, "fatal storage error in gc task; closing chain database");
                        inner.begin_close();
                        break;
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if inner.is_closed() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::debug!(target: "gc", "volatile gc task stopped");
}
