//! The block-fetch decision engine.
//!
//! Each call is a pure function of the current chain, the candidate
//! chains peers have offered, their in-flight accounting and their
//! measured response behavior. Per peer the result is either a
//! [`FetchRequest`] (ranges of headers to ask for) or a
//! [`FetchDecline`] naming why the peer gets nothing this round.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use itertools::Itertools;

use weft_chain::ChainPreference;
use weft_primitives::{AnchoredFragment, BlockHash, BlockHeader, Point};

/// Opaque peer key; the network layer owns the mapping to connections.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// A peer's measured response behavior: (G)oodput offset, (S)ervice
/// rate, (V)ariance.
#[derive(Clone, Copy, Debug)]
pub struct PeerGsv {
    /// One-way minimum transit time.
    pub g: Duration,
    /// Serviced bytes per second once data is flowing.
    pub bytes_per_second: f64,
    /// Variance of the response-time estimate, in seconds squared.
    pub v: f64,
}

impl PeerGsv {
    /// Expected wall-clock time until a response of `bytes` lands, with
    /// `in_flight_bytes` queued ahead of it.
    pub fn expected_response_duration(&self, in_flight_bytes: u64, bytes: u64) -> Duration {
        let transit = 2.0 * self.g.as_secs_f64();
        let service = (in_flight_bytes + bytes) as f64 / self.bytes_per_second.max(1.0);
        Duration::from_secs_f64(transit + service)
    }

    /// Probability that the response lands within `deadline`, under a
    /// gaussian response-time model.
    pub fn completion_probability(
        &self,
        in_flight_bytes: u64,
        bytes: u64,
        deadline: Duration,
    ) -> f64 {
        let mean = self.expected_response_duration(in_flight_bytes, bytes).as_secs_f64();
        let slack = deadline.as_secs_f64() - mean;
        if self.v <= f64::EPSILON {
            return if slack >= 0.0 { 1.0 } else { 0.0 };
        }
        normal_cdf(slack / self.v.sqrt())
    }
}

/// Φ(z) via the Abramowitz–Stegun erf approximation (7.1.26); the model
/// only needs band resolution, not tail accuracy.
fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    sign * (1.0 - poly * (-x * x).exp())
}

/// Fetch scheduling mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchMode {
    /// Maximize throughput; avoid requesting the same block from two
    /// peers.
    BulkSync,
    /// Meet a block-production deadline; duplicate in-flight blocks
    /// across peers to hedge latency.
    Deadline,
}

/// How confident the model is that a peer meets the deadline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProbabilityBand {
    Low,
    /// At least 75%.
    Moderate,
    /// At least 98%.
    High,
}

impl ProbabilityBand {
    fn of(probability: f64) -> Self {
        if probability >= 0.98 {
            ProbabilityBand::High
        } else if probability >= 0.75 {
            ProbabilityBand::Moderate
        } else {
            ProbabilityBand::Low
        }
    }
}

/// Accounting for requests currently outstanding with one peer.
#[derive(Clone, Debug, Default)]
pub struct PeerFetchInFlight {
    pub reqs_in_flight: u32,
    pub bytes_in_flight: u64,
    pub blocks_in_flight: HashSet<BlockHash>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerFetchStatus {
    Ready,
    /// Above the high watermark; wait for the low watermark before
    /// asking again.
    Busy,
}

/// One peer's standing in a decision round.
#[derive(Clone, Debug)]
pub struct PeerInput {
    pub peer: PeerId,
    /// The header chain the peer offered, anchored on our chain.
    pub candidate: AnchoredFragment,
    pub gsv: PeerGsv,
    pub in_flight: PeerFetchInFlight,
    pub status: PeerFetchStatus,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub max_reqs_per_peer: u32,
    /// Per-peer bytes-in-flight high watermark.
    pub max_bytes_in_flight_per_peer: u64,
    /// Per-request budget; one block is always granted even if it alone
    /// blows this.
    pub max_request_bytes: u64,
    pub max_request_blocks: usize,
    pub max_concurrency_bulk_sync: usize,
    pub max_concurrency_deadline: usize,
    /// The block-production deadline the probability bands are computed
    /// against.
    pub deadline: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            max_reqs_per_peer: 2,
            max_bytes_in_flight_per_peer: 1 << 20,
            max_request_bytes: 256 << 10,
            max_request_blocks: 20,
            max_concurrency_bulk_sync: 1,
            max_concurrency_deadline: 2,
            deadline: Duration::from_secs(2),
        }
    }
}

/// Ranges of consecutive headers to request from one peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchRequest {
    pub fragments: Vec<Vec<BlockHeader>>,
}

impl FetchRequest {
    pub fn block_count(&self) -> usize {
        self.fragments.iter().map(Vec::len).sum()
    }
}

/// Why a peer got no request this round.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FetchDecline {
    #[error("candidate chain is not preferred over the current chain")]
    ChainNotPlausible,
    #[error("candidate chain does not intersect the current chain")]
    ChainNoIntersection,
    #[error("all candidate blocks are already fetched or in flight")]
    AlreadyFetched,
    #[error("peer is busy; waiting for the low watermark")]
    PeerBusy,
    #[error("peer already has {0} requests in flight")]
    ReqsInFlightLimit(u32),
    #[error("peer already has {0} bytes in flight")]
    BytesInFlightLimit(u64),
    #[error("fetch concurrency limit of {0} peers reached")]
    ConcurrencyLimit(usize),
}

struct Annotated {
    input: PeerInput,
    /// The candidate's fork suffix that still needs fetching.
    wanted: Vec<BlockHeader>,
    band: ProbabilityBand,
    expected: Duration,
}

/// One decision round. Peers appear in the result in decision order, each
/// with a request or the reason it was declined.
pub fn fetch_decisions(
    current: &AnchoredFragment,
    preference: &dyn ChainPreference,
    mode: FetchMode,
    peers: Vec<PeerInput>,
    is_fetched: &dyn Fn(&Point) -> bool,
    config: &FetchConfig,
) -> Vec<(PeerId, Result<FetchRequest, FetchDecline>)> {
    let current_tip = current.head();
    let mut decisions: Vec<(PeerId, Result<FetchRequest, FetchDecline>)> = Vec::new();
    let mut annotated: Vec<Annotated> = Vec::new();

    for input in peers {
        // 1. Plausible: strictly preferred chains only.
        if !preference.prefer_candidate(&current_tip, &input.candidate.head()) {
            decisions.push((input.peer, Err(FetchDecline::ChainNotPlausible)));
            continue;
        }
        // 2. Fork suffix: the part past the intersection with our chain.
        let Some(intersection) = input.candidate.intersect(current) else {
            decisions.push((input.peer, Err(FetchDecline::ChainNoIntersection)));
            continue;
        };
        let suffix = input
            .candidate
            .headers_after(&intersection)
            .expect("intersection lies on the candidate");
        // 3./4. Drop blocks we have and blocks this peer is already
        // sending.
        let wanted: Vec<BlockHeader> = suffix
            .into_iter()
            .filter(|h| !is_fetched(&h.point()))
            .filter(|h| !input.in_flight.blocks_in_flight.contains(&h.hash()))
            .collect();

        let fetch_bytes: u64 = wanted.iter().map(|h| h.body_size() as u64).sum();
        let band = ProbabilityBand::of(input.gsv.completion_probability(
            input.in_flight.bytes_in_flight,
            fetch_bytes,
            config.deadline,
        ));
        let expected =
            input.gsv.expected_response_duration(input.in_flight.bytes_in_flight, fetch_bytes);
        annotated.push(Annotated { input, wanted, band, expected });
    }

    // 5. Prioritize.
    match mode {
        FetchMode::Deadline => {
            // Best band first, then the better candidate chain. Within a
            // (band, head) group the least-loaded peer goes first so
            // nobody is starved by arrival order.
            annotated.sort_by(|a, b| {
                b.band.cmp(&a.band).then_with(|| {
                    preference
                        .compare_candidates(&b.input.candidate.head(), &a.input.candidate.head())
                })
            });
            let grouped = annotated
                .into_iter()
                .group_by(|a| (a.band, a.input.candidate.head_point()));
            let mut interleaved = Vec::new();
            for (_, group) in &grouped {
                let mut group: Vec<Annotated> = group.collect();
                group.sort_by_key(|a| a.input.in_flight.bytes_in_flight);
                interleaved.extend(group);
            }
            annotated = interleaved;
        }
        FetchMode::BulkSync => {
            // Best candidate first; among peers serving it, the faster
            // one.
            annotated.sort_by(|a, b| {
                preference
                    .compare_candidates(&b.input.candidate.head(), &a.input.candidate.head())
                    .then_with(|| a.expected.cmp(&b.expected))
            });
        }
    }

    // 6./7. Stateful walk over the prioritized list.
    let mut other_peers_in_flight: HashSet<BlockHash> = HashSet::new();
    if mode == FetchMode::BulkSync {
        for a in &annotated {
            other_peers_in_flight.extend(a.input.in_flight.blocks_in_flight.iter().copied());
        }
    }
    let mut engaged: HashSet<PeerId> = annotated
        .iter()
        .filter(|a| a.input.in_flight.reqs_in_flight > 0)
        .map(|a| a.input.peer)
        .collect();
    let max_concurrency = match mode {
        FetchMode::BulkSync => config.max_concurrency_bulk_sync,
        FetchMode::Deadline => config.max_concurrency_deadline,
    };

    for Annotated { input, wanted, band, .. } in annotated {
        let wanted: Vec<BlockHeader> = match mode {
            // In bulk sync a block already in flight from anyone is not
            // requested again; in deadline mode duplication is the point.
            FetchMode::BulkSync => wanted
                .into_iter()
                .filter(|h| !other_peers_in_flight.contains(&h.hash()))
                .collect(),
            FetchMode::Deadline => wanted,
        };
        if wanted.is_empty() {
            decisions.push((input.peer, Err(FetchDecline::AlreadyFetched)));
            continue;
        }
        if input.status == PeerFetchStatus::Busy {
            decisions.push((input.peer, Err(FetchDecline::PeerBusy)));
            continue;
        }
        if input.in_flight.reqs_in_flight >= config.max_reqs_per_peer {
            decisions
                .push((input.peer, Err(FetchDecline::ReqsInFlightLimit(input.in_flight.reqs_in_flight))));
            continue;
        }
        if input.in_flight.bytes_in_flight >= config.max_bytes_in_flight_per_peer {
            decisions.push((
                input.peer,
                Err(FetchDecline::BytesInFlightLimit(input.in_flight.bytes_in_flight)),
            ));
            continue;
        }
        if !engaged.contains(&input.peer) && engaged.len() >= max_concurrency {
            decisions.push((input.peer, Err(FetchDecline::ConcurrencyLimit(max_concurrency))));
            continue;
        }

        // Select blocks up to the request budget; always at least one so
        // a block bigger than the whole budget cannot wedge the fetcher.
        let mut selected: Vec<BlockHeader> = Vec::new();
        let mut bytes = 0u64;
        for header in wanted {
            if !selected.is_empty()
                && (bytes + header.body_size() as u64 > config.max_request_bytes
                    || selected.len() >= config.max_request_blocks)
            {
                break;
            }
            bytes += header.body_size() as u64;
            selected.push(header);
        }
        if mode == FetchMode::BulkSync {
            other_peers_in_flight.extend(selected.iter().map(|h| h.hash()));
        }
        engaged.insert(input.peer);

        tracing::trace!(
            target: "sync",
            peer = ?input.peer,
            blocks = selected.len(),
            bytes,
            ?band,
            "fetch request",
        );
        decisions.push((input.peer, Ok(FetchRequest { fragments: fragments_of(selected) })));
    }
    decisions
}

/// Splits a run of headers into maximal parent-linked fragments.
fn fragments_of(headers: Vec<BlockHeader>) -> Vec<Vec<BlockHeader>> {
    let mut fragments: Vec<Vec<BlockHeader>> = Vec::new();
    for header in headers {
        match fragments.last_mut() {
            Some(run)
                if run
                    .last()
                    .is_some_and(|prev| header.prev_hash().hash() == Some(prev.hash())) =>
            {
                run.push(header);
            }
            _ => fragments.push(vec![header]),
        }
    }
    fragments
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use weft_chain::LongestChain;
    use weft_primitives::test_utils::TestBlockBuilder;
    use weft_primitives::{Block, Tip};

    fn fragment_of(blocks: &[Block]) -> AnchoredFragment {
        let mut fragment = AnchoredFragment::empty();
        for block in blocks {
            fragment.push(block.header().clone()).unwrap();
        }
        fragment
    }

    fn chain_with_bodies(n: usize, body: usize) -> Vec<Block> {
        let mut blocks = Vec::new();
        let mut tip = Tip::genesis();
        for i in 0..n {
            let block = TestBlockBuilder::from_tip(&tip).body(vec![i as u8; body]).build();
            tip = block.header().tip();
            blocks.push(block);
        }
        blocks
    }

    fn fast_gsv() -> PeerGsv {
        PeerGsv { g: Duration::from_millis(10), bytes_per_second: 1_000_000.0, v: 0.0 }
    }

    fn slow_gsv() -> PeerGsv {
        PeerGsv { g: Duration::from_millis(900), bytes_per_second: 2_000.0, v: 0.01 }
    }

    fn peer(id: u64, candidate: AnchoredFragment, gsv: PeerGsv) -> PeerInput {
        PeerInput {
            peer: PeerId(id),
            candidate,
            gsv,
            in_flight: PeerFetchInFlight::default(),
            status: PeerFetchStatus::Ready,
        }
    }

    fn decide(
        current: &AnchoredFragment,
        mode: FetchMode,
        peers: Vec<PeerInput>,
        config: &FetchConfig,
    ) -> Vec<(PeerId, Result<FetchRequest, FetchDecline>)> {
        fetch_decisions(current, &LongestChain, mode, peers, &|_| false, config)
    }

    #[test]
    fn shorter_candidate_not_plausible() {
        let blocks = chain_with_bodies(5, 100);
        let current = fragment_of(&blocks);
        let candidate = fragment_of(&blocks[..3]);
        let decisions = decide(
            &current,
            FetchMode::BulkSync,
            vec![peer(1, candidate, fast_gsv())],
            &FetchConfig::default(),
        );
        assert_eq!(decisions[0].1, Err(FetchDecline::ChainNotPlausible));
    }

    #[test]
    fn disjoint_candidate_has_no_intersection() {
        let ours = chain_with_bodies(2, 10);
        let current = fragment_of(&ours);
        // A longer chain built from a different genesis block.
        let foreign_base = TestBlockBuilder::from_tip(&Tip::genesis()).issuer(9).build();
        let mut theirs = vec![foreign_base];
        for _ in 0..3 {
            theirs.push(TestBlockBuilder::new(theirs.last().unwrap().header()).issuer(9).build());
        }
        let mut candidate = AnchoredFragment::new(theirs[0].header().tip());
        for block in &theirs[1..] {
            candidate.push(block.header().clone()).unwrap();
        }
        let decisions = decide(
            &current,
            FetchMode::BulkSync,
            vec![peer(1, candidate, fast_gsv())],
            &FetchConfig::default(),
        );
        assert_eq!(decisions[0].1, Err(FetchDecline::ChainNoIntersection));
    }

    #[test]
    fn requests_only_the_fork_suffix() {
        let blocks = chain_with_bodies(6, 100);
        let current = fragment_of(&blocks[..4]);
        let candidate = fragment_of(&blocks);
        let decisions = decide(
            &current,
            FetchMode::BulkSync,
            vec![peer(1, candidate, fast_gsv())],
            &FetchConfig::default(),
        );
        let request = decisions[0].1.as_ref().unwrap();
        assert_eq!(request.block_count(), 2);
        assert_eq!(request.fragments.len(), 1);
        assert_eq!(request.fragments[0][0].hash(), blocks[4].hash());
    }

    #[test]
    fn already_fetched_blocks_are_skipped() {
        let blocks = chain_with_bodies(6, 100);
        let current = fragment_of(&blocks[..4]);
        let candidate = fragment_of(&blocks);
        let fetched_hash = blocks[4].hash();
        let decisions = fetch_decisions(
            &current,
            &LongestChain,
            FetchMode::BulkSync,
            vec![peer(1, candidate, fast_gsv())],
            &|point| point.hash() == Some(fetched_hash),
            &FetchConfig::default(),
        );
        let request = decisions[0].1.as_ref().unwrap();
        assert_eq!(request.block_count(), 1);
        assert_eq!(request.fragments[0][0].hash(), blocks[5].hash());
    }

    #[test]
    fn bulk_sync_deduplicates_across_peers() {
        let blocks = chain_with_bodies(6, 100);
        let current = fragment_of(&blocks[..4]);
        let decisions = decide(
            &current,
            FetchMode::BulkSync,
            vec![
                peer(1, fragment_of(&blocks), fast_gsv()),
                peer(2, fragment_of(&blocks), fast_gsv()),
            ],
            &FetchConfig { max_concurrency_bulk_sync: 2, ..FetchConfig::default() },
        );
        let granted: Vec<_> = decisions.iter().filter(|(_, d)| d.is_ok()).collect();
        assert_eq!(granted.len(), 1);
        let declined: Vec<_> = decisions.iter().filter(|(_, d)| d.is_err()).collect();
        assert_matches!(declined[0].1, Err(FetchDecline::AlreadyFetched));
    }

    #[test]
    fn deadline_mode_hedges_across_peers() {
        let blocks = chain_with_bodies(6, 100);
        let current = fragment_of(&blocks[..4]);
        let decisions = decide(
            &current,
            FetchMode::Deadline,
            vec![
                peer(1, fragment_of(&blocks), fast_gsv()),
                peer(2, fragment_of(&blocks), fast_gsv()),
            ],
            &FetchConfig::default(),
        );
        assert!(decisions.iter().all(|(_, d)| d.is_ok()));
    }

    #[test]
    fn deadline_mode_prefers_the_confident_peer() {
        let blocks = chain_with_bodies(6, 2_000);
        let current = fragment_of(&blocks[..4]);
        let decisions = decide(
            &current,
            FetchMode::Deadline,
            vec![
                peer(1, fragment_of(&blocks), slow_gsv()),
                peer(2, fragment_of(&blocks), fast_gsv()),
            ],
            &FetchConfig::default(),
        );
        // The fast peer sorts first despite arriving second.
        assert_eq!(decisions[0].0, PeerId(2));
        assert!(decisions[0].1.is_ok());
    }

    #[test]
    fn byte_budget_bounds_a_request_but_one_block_always_goes() {
        let blocks = chain_with_bodies(6, 300);
        let current = fragment_of(&blocks[..1]);
        let config = FetchConfig { max_request_bytes: 500, ..FetchConfig::default() };
        let decisions = decide(
            &current,
            FetchMode::BulkSync,
            vec![peer(1, fragment_of(&blocks), fast_gsv())],
            &config,
        );
        let request = decisions[0].1.as_ref().unwrap();
        // 300 + 300 > 500, so exactly one block fits; it still goes even
        // though a second would not.
        assert_eq!(request.block_count(), 1);

        // A single block bigger than the whole budget is still granted.
        let huge = chain_with_bodies(2, 10_000);
        let current = fragment_of(&huge[..1]);
        let decisions = decide(
            &current,
            FetchMode::BulkSync,
            vec![peer(1, fragment_of(&huge), fast_gsv())],
            &config,
        );
        assert_eq!(decisions[0].1.as_ref().unwrap().block_count(), 1);
    }

    #[test]
    fn in_flight_limits_decline() {
        let blocks = chain_with_bodies(4, 100);
        let current = fragment_of(&blocks[..2]);
        let config = FetchConfig::default();

        let mut busy = peer(1, fragment_of(&blocks), fast_gsv());
        busy.status = PeerFetchStatus::Busy;
        let mut maxed_reqs = peer(2, fragment_of(&blocks), fast_gsv());
        maxed_reqs.in_flight.reqs_in_flight = config.max_reqs_per_peer;
        let mut maxed_bytes = peer(3, fragment_of(&blocks), fast_gsv());
        maxed_bytes.in_flight.bytes_in_flight = config.max_bytes_in_flight_per_peer;

        let decisions =
            decide(&current, FetchMode::Deadline, vec![busy, maxed_reqs, maxed_bytes], &config);
        let by_peer: std::collections::HashMap<_, _> = decisions.into_iter().collect();
        assert_eq!(by_peer[&PeerId(1)], Err(FetchDecline::PeerBusy));
        assert_matches!(by_peer[&PeerId(2)], Err(FetchDecline::ReqsInFlightLimit(_)));
        assert_matches!(by_peer[&PeerId(3)], Err(FetchDecline::BytesInFlightLimit(_)));
    }

    #[test]
    fn bulk_sync_concurrency_limit() {
        // Two peers offering disjoint forks: the better one takes the
        // single bulk-sync slot, the other is cut off by concurrency.
        let common = chain_with_bodies(2, 100);
        let mut long_fork = common.clone();
        for _ in 0..3 {
            long_fork.push(TestBlockBuilder::new(long_fork.last().unwrap().header()).issuer(1).build());
        }
        let mut short_fork = common.clone();
        for _ in 0..2 {
            short_fork
                .push(TestBlockBuilder::new(short_fork.last().unwrap().header()).issuer(2).build());
        }
        let current = fragment_of(&common);
        let decisions = decide(
            &current,
            FetchMode::BulkSync,
            vec![
                peer(1, fragment_of(&long_fork), fast_gsv()),
                peer(2, fragment_of(&short_fork), fast_gsv()),
            ],
            &FetchConfig::default(),
        );
        let by_peer: std::collections::HashMap<_, _> = decisions.into_iter().collect();
        assert!(by_peer[&PeerId(1)].is_ok());
        assert_eq!(by_peer[&PeerId(2)], Err(FetchDecline::ConcurrencyLimit(1)));
    }

    #[test]
    fn fragments_split_at_gaps() {
        let blocks = chain_with_bodies(5, 10);
        // Headers 0,1 then 3,4: the missing 2 splits the request in two.
        let headers: Vec<BlockHeader> = [0, 1, 3, 4]
            .into_iter()
            .map(|i| blocks[i].header().clone())
            .collect();
        let fragments = fragments_of(headers);
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].len(), 2);
        assert_eq!(fragments[1].len(), 2);
    }

    #[test]
    fn probability_bands() {
        let gsv = PeerGsv { g: Duration::from_millis(50), bytes_per_second: 1_000_000.0, v: 0.0001 };
        let deadline = Duration::from_secs(2);
        assert_eq!(ProbabilityBand::of(gsv.completion_probability(0, 10_000, deadline)), ProbabilityBand::High);

        let slow = PeerGsv { g: Duration::from_millis(50), bytes_per_second: 10_000.0, v: 0.0001 };
        assert_eq!(ProbabilityBand::of(slow.completion_probability(0, 100_000, deadline)), ProbabilityBand::Low);
    }
}
