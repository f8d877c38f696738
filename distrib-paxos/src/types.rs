//! Core types for the consensus protocol.
//!
//! - [`LogIndex`]: position of a register in the replicated log
//! - [`PaxosState`]: what one replica knows about one register
//! - [`PaxosError`]: error type for all Paxos operations

use distrib_core::{GenerationId, ReplicaId};
use distrib_transport::NetworkError;
use distrib_wal::WalError;
use serde::{Deserialize, Serialize};

/// Opaque value agreed on by consensus.
pub type Value = Vec<u8>;

/// Position in the replicated log.
///
/// Single-value Paxos uses [`LogIndex::REGISTER`]; the log starts at
/// [`LogIndex::FIRST`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct LogIndex(pub u64);

impl LogIndex {
    /// The register used by single-value Paxos.
    pub const REGISTER: Self = Self(0);

    /// The first index of the replicated log.
    pub const FIRST: Self = Self(1);

    /// Create a new log index.
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    /// Get the next sequential index.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for LogIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "index({})", self.0)
    }
}

/// Per-register acceptor state.
///
/// Once `committed_value` is set it never changes. `accepted_generation`, when
/// present, never exceeds `promised_generation`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaxosState {
    /// Highest generation this replica promised for the register.
    pub promised_generation: GenerationId,

    /// Generation under which `accepted_value` was accepted.
    pub accepted_generation: Option<GenerationId>,

    /// Most recently accepted value.
    pub accepted_value: Option<Value>,

    /// Generation of the commit that settled the register.
    pub committed_generation: Option<GenerationId>,

    /// The chosen value, once known here.
    pub committed_value: Option<Value>,
}

impl PaxosState {
    /// Whether the register has been committed on this replica.
    pub fn is_committed(&self) -> bool {
        self.committed_value.is_some()
    }

    /// The accepted generation and value, if any.
    pub fn accepted(&self) -> Option<(GenerationId, &Value)> {
        match (self.accepted_generation, self.accepted_value.as_ref()) {
            (Some(generation), Some(value)) => Some((generation, value)),
            _ => None,
        }
    }
}

/// Errors that can occur during Paxos operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaxosError {
    /// A replica holds a higher generation than the one attempted.
    ///
    /// Recoverable: the proposer retries with a generation above `seen`.
    #[error("stale generation {attempted}, replicas have seen {seen}")]
    StaleGeneration {
        /// Generation the proposer used.
        attempted: GenerationId,
        /// Highest generation reported by a rejecting replica.
        seen: GenerationId,
    },

    /// Too many replicas failed or refused for a quorum to form.
    #[error("quorum unreachable: {rejections} rejections, {errors} errors")]
    QuorumUnreachable {
        /// Replicas that answered without granting the request.
        rejections: usize,
        /// Replicas that failed or timed out.
        errors: usize,
    },

    /// Every retry lost to a competing proposer.
    #[error("gave up after {attempts} attempts")]
    RetriesExhausted {
        /// Attempts made.
        attempts: usize,
    },

    /// Waiting for a decision or for an entry to apply took too long.
    #[error("operation timed out")]
    Timeout,

    /// A round finished without any value to choose.
    #[error("no value chosen")]
    NothingChosen,

    /// Persisting consensus state failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A persisted record or command could not be decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// A message could not be handed to the network.
    #[error("network error: {0}")]
    Network(String),

    /// The state machine refused a committed command.
    #[error("apply error: {0}")]
    Apply(String),

    /// A peer answered with a failure.
    #[error("{replica} failed: {reason}")]
    Remote {
        /// Replica that answered.
        replica: ReplicaId,
        /// Its description of the failure.
        reason: String,
    },

    /// The replica is shutting down.
    #[error("replica shut down")]
    Shutdown,
}

impl From<WalError> for PaxosError {
    fn from(err: WalError) -> Self {
        PaxosError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for PaxosError {
    fn from(err: serde_json::Error) -> Self {
        PaxosError::Codec(err.to_string())
    }
}

impl From<NetworkError> for PaxosError {
    fn from(err: NetworkError) -> Self {
        PaxosError::Network(err.to_string())
    }
}
