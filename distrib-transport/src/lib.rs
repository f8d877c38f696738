//! # distrib-transport
//!
//! The generic replication substrate: how a coordinator sends a request to
//! every replica and turns the replies into one decision.
//!
//! ```text
//!  coordinator                         replicas
//!  ───────────                         ────────
//!  QuorumCallback ◀─┐
//!                   │ register(id_n, cb)
//!  RequestWaitingList ──── send_one_way(id_n) ────▶ handler
//!        ▲                                            │
//!        └────── handle_response(id_n, resp, from) ◀──┘
//!        └────── sweep: on_error(Timeout) after expiry
//! ```
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`waiting_list`] | Correlation id to pending callback, with timeout expiry |
//! | [`quorum`] | Majority aggregation, async and blocking flavors |
//! | [`network`] | One-way send seam and the in-process [`LocalNetwork`] |

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod network;
pub mod quorum;
pub mod waiting_list;

pub use network::{LocalEndpoint, LocalNetwork, Network, NetworkError};
pub use quorum::{
    quorum_size, AsyncQuorumCallback, BlockingQuorumCallback, QuorumError, QuorumFuture,
    QuorumResult, QuorumTracker,
};
pub use waiting_list::{
    CorrelationId, RequestCallback, RequestError, RequestWaitingList, ResponseFuture,
    SingleResponseCallback, WaitingListConfig, WaitingListError,
};
