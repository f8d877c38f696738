//! Messages exchanged between replicas.
//!
//! One tagged sum type per direction, dispatched by a single `match`:
//!
//! | Request | Response |
//! |---|---|
//! | `Prepare { generation, target }` | `Promise(Promise)` |
//! | `Accept { generation, index, value }` | `Accepted { accepted, promised_generation }` |
//! | `Commit { generation, index, value }` | `CommitAck` |
//! | `GenerationPrepare { candidate }` | `GenerationPromise { promised, watermark }` |
//! | `NextNumber` | `NextNumber { number }` |
//!
//! Every message travels one way inside an [`Envelope`]. A response carries
//! the [`CorrelationId`] of the request it answers. Types derive serde so a
//! transport can encode them; nothing in this crate does.

use std::collections::BTreeMap;

use distrib_core::{GenerationId, ReplicaId};
use distrib_transport::CorrelationId;
use serde::{Deserialize, Serialize};

use crate::types::{LogIndex, PaxosState, Value};

/// What a prepare covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrepareTarget {
    /// One register.
    Register(LogIndex),
    /// Every index from `from` onward, in one round.
    FullLog {
        /// First index the requester wants reported.
        from: LogIndex,
    },
}

/// Requests a replica handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Phase 1.
    Prepare {
        /// Proposer's generation.
        generation: GenerationId,
        /// Register or whole log.
        target: PrepareTarget,
    },
    /// Phase 2.
    Accept {
        /// Proposer's generation.
        generation: GenerationId,
        /// Register to write.
        index: LogIndex,
        /// Value to accept.
        value: Value,
    },
    /// Phase 3, best-effort.
    Commit {
        /// Generation the value was chosen under.
        generation: GenerationId,
        /// Register being settled.
        index: LogIndex,
        /// The chosen value.
        value: Value,
    },
    /// Generation voting: promise not to go below `candidate`.
    GenerationPrepare {
        /// Number the coordinator wants to hand out.
        candidate: GenerationId,
    },
    /// Ask the receiving replica to coordinate a generation vote.
    NextNumber,
}

impl Request {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Prepare { .. } => "prepare",
            Request::Accept { .. } => "accept",
            Request::Commit { .. } => "commit",
            Request::GenerationPrepare { .. } => "generation_prepare",
            Request::NextNumber => "next_number",
        }
    }
}

/// Answer to a [`Request::Prepare`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promise {
    /// Whether the replica promised.
    pub promised: bool,

    /// On success the generation promised; on rejection the higher
    /// generation the replica already holds.
    pub promised_generation: GenerationId,

    /// Generation of the value accepted for the register, if any.
    pub accepted_generation: Option<GenerationId>,

    /// Value accepted for the register, if any.
    pub accepted_value: Option<Value>,

    /// Chosen value, if the replica already knows it.
    pub committed_value: Option<Value>,

    /// Full-log prepares only: state of every index at or after the
    /// requested start that holds an accepted value.
    pub uncommitted: BTreeMap<LogIndex, PaxosState>,
}

/// Responses a replica sends back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Answer to a prepare.
    Promise(Promise),
    /// Answer to an accept.
    Accepted {
        /// Whether the value was accepted.
        accepted: bool,
        /// Generation the replica now holds.
        promised_generation: GenerationId,
    },
    /// Answer to a commit.
    CommitAck,
    /// Answer to a generation prepare.
    GenerationPromise {
        /// Whether the replica promised the candidate.
        promised: bool,
        /// The replica's watermark after handling the request.
        watermark: GenerationId,
    },
    /// Answer to a next-number request.
    NextNumber {
        /// The allocated number.
        number: GenerationId,
    },
    /// The replica could not process the request.
    Failed {
        /// Human-readable cause.
        reason: String,
    },
}

impl Response {
    /// Quorum predicate for prepares.
    pub fn is_promised(&self) -> bool {
        matches!(self, Response::Promise(promise) if promise.promised)
    }

    /// Quorum predicate for accepts.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Response::Accepted { accepted: true, .. })
    }

    /// Quorum predicate for generation voting.
    pub fn is_generation_promised(&self) -> bool {
        matches!(self, Response::GenerationPromise { promised: true, .. })
    }

    /// Generation a replica reported holding, for rejected responses.
    pub fn seen_generation(&self) -> Option<GenerationId> {
        match self {
            Response::Promise(promise) => Some(promise.promised_generation),
            Response::Accepted {
                promised_generation,
                ..
            } => Some(*promised_generation),
            Response::GenerationPromise { watermark, .. } => Some(*watermark),
            Response::NextNumber { number } => Some(*number),
            Response::CommitAck | Response::Failed { .. } => None,
        }
    }
}

/// Either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Inbound work.
    Request(Request),
    /// Reply to an earlier request.
    Response(Response),
}

/// Unit of one-way delivery between replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender.
    pub from: ReplicaId,
    /// Correlates a response with its request.
    pub correlation_id: CorrelationId,
    /// Payload.
    pub message: Message,
}
