//! Client-side sync machinery. Currently the block-fetch decision
//! engine: given the current chain and what every peer offers, decide
//! which block ranges to request from whom.

pub mod fetch;

pub use fetch::{
    FetchConfig, FetchDecline, FetchMode, FetchRequest, PeerFetchInFlight, PeerFetchStatus,
    PeerGsv, PeerId, PeerInput, ProbabilityBand, fetch_decisions,
};
