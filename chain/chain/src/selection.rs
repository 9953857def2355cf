//! Chain selection: build candidate suffixes out of the volatile pool,
//! order them by the protocol's preference, validate them against the
//! ledger, and adopt the best one.
//!
//! Runs only on the add-block worker, so the current chain cannot change
//! underneath a selection pass; the commit still happens atomically under
//! the chain lock so readers never observe a half-switch.

use std::collections::{HashMap, HashSet};

use weft_primitives::block::PrevHash;
use weft_primitives::{BlockHash, BlockHeader, Point, Tip};
use weft_store::{StoreError, VolatileDb};

use crate::chain_db::ChainDbInner;
use crate::types::InvalidBlockReason;
use crate::{metrics, readers};

/// A chain suffix competing with the current chain: everything after its
/// fork point on the current fragment.
struct Candidate {
    fork_point: Point,
    /// Headers of the current chain this candidate would drop.
    rollback: usize,
    headers: Vec<BlockHeader>,
    /// Construction order, used to keep the candidate order total.
    order: usize,
}

impl Candidate {
    fn tip(&self) -> Tip {
        self.headers.last().expect("candidates are non-empty").tip()
    }
}

/// One full selection pass. Mutates the chain only if a candidate both
/// validates and is preferred over the current chain.
pub(crate) fn chain_selection(inner: &ChainDbInner) -> Result<(), StoreError> {
    let now_slot = inner.now_slot();
    let skew = inner.config.clock_skew_slots;
    let k = inner.config.security_param as usize;

    // The worker is the only mutator, so a snapshot taken here stays
    // accurate for the whole pass.
    let (current, ledger, invalid) = {
        let chain = inner.chain.lock();
        (chain.current.clone(), chain.ledger.clone(), chain.invalid.snapshot().value)
    };
    let current_tip = current.head();

    let mut candidates = build_candidates(&inner.storage.volatile, &current, k);

    // Split off future headers: those within the skew are parked for a
    // later pass, the candidate continues with its settled prefix.
    let mut deferred: Vec<BlockHeader> = Vec::new();
    for candidate in &mut candidates {
        if let Some(cut) = candidate.headers.iter().position(|h| h.slot() > now_slot) {
            for header in &candidate.headers[cut..] {
                if header.slot() <= now_slot + skew {
                    deferred.push(header.clone());
                }
            }
            candidate.headers.truncate(cut);
        }
    }
    if !deferred.is_empty() {
        let mut chain = inner.chain.lock();
        for header in deferred {
            chain.future.insert(header.hash(), header);
        }
    }

    let mut queue: Vec<Candidate> = candidates
        .into_iter()
        .filter(|candidate| {
            !candidate.headers.is_empty()
                && !candidate.headers.iter().any(|h| invalid.contains_key(&h.hash()))
                && inner.preference.prefer_candidate(&current_tip, &candidate.tip())
        })
        .collect();

    let mut newly_invalid: HashSet<BlockHash> = HashSet::new();
    'outer: loop {
        // Invalidation during the pass reorders what is left, so sort
        // every round. Ties: construction order, then tip hash.
        queue.sort_by(|a, b| {
            inner
                .preference
                .compare_candidates(&b.tip(), &a.tip())
                .then_with(|| a.order.cmp(&b.order))
                .then_with(|| a.tip().point.hash().cmp(&b.tip().point.hash()))
        });
        if queue.is_empty() {
            return Ok(());
        }
        let mut candidate = queue.remove(0);
        if candidate.headers.iter().any(|h| newly_invalid.contains(&h.hash())) {
            continue;
        }

        let Ok(mut working) = ledger.rewind(&candidate.fork_point) else {
            // The fork point left the rewind window mid-pass; the
            // candidate is no longer viable.
            tracing::debug!(
                target: "chain",
                fork = %candidate.fork_point,
                "fork point outside the ledger window; skipping candidate",
            );
            continue;
        };

        for (i, header) in candidate.headers.iter().enumerate() {
            let block = match inner.storage.volatile.get(&header.hash())? {
                Some(block) => block,
                // Collected while we were selecting; if the copy task
                // already settled it, read it back from the immutable
                // store, otherwise give up on this candidate.
                None => match inner.storage.immutable.get_block(&header.point())? {
                    Some(block) => block,
                    None => {
                        tracing::debug!(
                            target: "chain",
                            block = %header.point(),
                            "candidate block no longer in either store; abandoning candidate",
                        );
                        continue 'outer;
                    }
                },
            };
            match working.push(inner.rules.as_ref(), &block) {
                Ok(()) => {}
                Err(error) => {
                    tracing::warn!(
                        target: "chain",
                        block = %header.point(),
                        %error,
                        "block failed validation",
                    );
                    {
                        let mut chain = inner.chain.lock();
                        if chain.invalid.insert(
                            header.hash(),
                            InvalidBlockReason::Ledger(error.to_string()),
                            header.slot(),
                        ) {
                            metrics::INVALID_BLOCKS_TOTAL.inc();
                        }
                    }
                    let bad = header.hash();
                    newly_invalid.insert(bad);
                    // The truncated prefix validated so far and may still
                    // win; everything else carrying the bad block is out.
                    candidate.headers.truncate(i);
                    queue.retain(|c| !c.headers.iter().any(|h| h.hash() == bad));
                    if !candidate.headers.is_empty()
                        && inner.preference.prefer_candidate(&current_tip, &candidate.tip())
                    {
                        queue.push(candidate);
                    }
                    continue 'outer;
                }
            }
        }

        // Validated in full; adopt unless preference shifted away (it
        // cannot have, but the check is cheap and the contract explicit).
        if !inner.preference.prefer_candidate(&current_tip, &candidate.tip()) {
            continue;
        }
        adopt(inner, &candidate, working);
        return Ok(());
    }
}

/// All maximal extensions of the current chain reachable through the
/// volatile pool from a fork point within the last `k` headers (or the
/// anchor, while the chain is shorter than `k`).
fn build_candidates(
    volatile: &VolatileDb,
    current: &weft_primitives::AnchoredFragment,
    k: usize,
) -> Vec<Candidate> {
    let len = current.len();
    // Fork tips newest-first; rollback depth is the number of current
    // headers dropped when forking there.
    let mut fork_tips: Vec<(Tip, usize)> = current
        .headers()
        .enumerate()
        .filter_map(|(i, h)| {
            let rollback = len - 1 - i;
            (rollback <= k).then(|| (h.tip(), rollback))
        })
        .collect();
    fork_tips.reverse();
    if len <= k {
        fork_tips.push((current.anchor(), len));
    }

    // One batched successor query decides which fork points are worth
    // walking at all.
    let prevs: Vec<PrevHash> =
        fork_tips.iter().map(|(t, _)| t.hash().map_or(PrevHash::Genesis, PrevHash::Block)).collect();
    let children_of = volatile.filter_by_predecessor(prevs.iter());

    let mut candidates: Vec<Candidate> = Vec::new();
    let mut best_by_tip: HashMap<BlockHash, usize> = HashMap::new();
    let mut order = 0;
    for (fork_tip, rollback) in fork_tips {
        let prev = fork_tip.hash().map_or(PrevHash::Genesis, PrevHash::Block);
        if !children_of.contains_key(&prev) {
            continue;
        }
        for headers in extensions_of(volatile, fork_tip) {
            let tip_hash = headers.last().expect("non-empty extension").hash();
            match best_by_tip.get(&tip_hash) {
                // The same tip through a shallower fork point already
                // exists; keep the cheaper rollback.
                Some(&existing) if candidates[existing].rollback <= rollback => continue,
                Some(&existing) => {
                    candidates[existing] = Candidate {
                        fork_point: fork_tip.point,
                        rollback,
                        headers,
                        order: candidates[existing].order,
                    };
                }
                None => {
                    best_by_tip.insert(tip_hash, candidates.len());
                    candidates.push(Candidate {
                        fork_point: fork_tip.point,
                        rollback,
                        headers,
                        order,
                    });
                    order += 1;
                }
            }
        }
    }
    candidates
}

/// Depth-first walk of the successor index: every maximal path of pooled
/// headers extending `start`. Children are visited in hash order so the
/// result is deterministic.
fn extensions_of(volatile: &VolatileDb, start: Tip) -> Vec<Vec<BlockHeader>> {
    let mut results = Vec::new();
    let mut stack: Vec<(Tip, Vec<BlockHeader>)> = vec![(start, Vec::new())];
    while let Some((tip, path)) = stack.pop() {
        let prev = tip.hash().map_or(PrevHash::Genesis, PrevHash::Block);
        let mut children: Vec<BlockHash> = volatile.successors(&prev).into_iter().collect();
        children.sort();
        let mut extended = false;
        for child in children {
            let Some(header) = volatile.get_header(&child) else { continue };
            if !extends(&tip, &header) {
                continue;
            }
            let mut next = path.clone();
            next.push(header.clone());
            stack.push((header.tip(), next));
            extended = true;
        }
        if !extended && !path.is_empty() {
            results.push(path);
        }
    }
    results
}

/// Structural check that `header` continues `tip`: parent link, dense
/// block number, advancing slot (shared across a boundary block edge).
fn extends(tip: &Tip, header: &BlockHeader) -> bool {
    if !header.prev_hash().points_at(&tip.point) {
        return false;
    }
    if header.block_no() != tip.next_block_no() {
        return false;
    }
    match tip.slot() {
        None => true,
        Some(tip_slot) if tip.is_boundary && !header.is_boundary() => header.slot() >= tip_slot,
        Some(tip_slot) => header.slot() > tip_slot,
    }
}

/// Commits the winning candidate: fragment, ledger and reader positions
/// change under one lock acquisition.
fn adopt(inner: &ChainDbInner, candidate: &Candidate, new_ledger: weft_store::ledger::LedgerDb) {
    let mut chain = inner.chain.lock();
    let old_tip = chain.current.head();
    let dropped = chain
        .current
        .rollback_to(&candidate.fork_point)
        .expect("fork point lies on the current chain");
    for header in &candidate.headers {
        chain.current.push(header.clone()).expect("validated candidate extends its fork point");
    }
    chain.ledger = new_ledger;
    debug_assert_eq!(chain.ledger.tip_point(), chain.current.head().point);

    if !dropped.is_empty() {
        metrics::CHAIN_SWITCHES_TOTAL.inc();
        let dropped_points: HashSet<Point> = dropped.iter().map(|h| h.point()).collect();
        readers::switch_fork(&mut chain, candidate.fork_point, &dropped_points);
    }

    let new_tip = chain.current.head();
    metrics::HEAD_HEIGHT.set(new_tip.block_no.unwrap_or(0) as i64);
    metrics::HEAD_SLOT.set(new_tip.slot().unwrap_or(0) as i64);
    drop(chain);
    inner.chain_changed.notify_all();

    if dropped.is_empty() {
        tracing::debug!(
            target: "chain",
            old = %old_tip.point,
            new = %new_tip.point,
            added = candidate.headers.len(),
            "extended current chain",
        );
    } else {
        tracing::info!(
            target: "chain",
            old = %old_tip.point,
            new = %new_tip.point,
            rollback = dropped.len(),
            added = candidate.headers.len(),
            "switched to a fork",
        );
    }
}
