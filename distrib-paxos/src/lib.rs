//! # distrib-paxos
//!
//! Paxos consensus over the distrib-transport substrate.
//!
//! Every replica is acceptor, proposer and learner at once. Clients pick one
//! of three front ends on top of a started [`Replica`]:
//!
//! | Front end | Agrees on | Phases per operation |
//! |---|---|---|
//! | [`SingleValuePaxos`] | one register, chosen once | prepare, accept, commit |
//! | [`PaxosLog`] in [`LogMode::PerIndex`] | an ordered log of commands | prepare, accept, commit |
//! | [`PaxosLog`] in [`LogMode::LeaderBased`] | an ordered log of commands | accept, commit (after election) |
//!
//! [`Replica::next_number`] hands out cluster-unique, increasing
//! [`GenerationId`](distrib_core::GenerationId)s through a single quorum
//! vote, without running full Paxos.
//!
//! ## Module overview
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`types`] | [`LogIndex`], [`PaxosState`], [`PaxosError`] |
//! | [`message`] | Requests, responses and the [`Envelope`] on the wire |
//! | [`storage`] | Durable acceptor state: in memory or on the WAL |
//! | [`acceptor`] | Promise and accept rules for each register |
//! | [`voting`] | Generation voting |
//! | [`proposer`] | Prepare/accept/commit rounds with retry |
//! | [`replica`] | Dispatch, messaging and ordered apply |
//! | [`single`] | Single-value register |
//! | [`log`] | Replicated log, per-index or leader-based |
//! | [`state_machine`] | Consumers of the committed log |
//! | [`config`] | [`ReplicaConfig`] |
//!
//! ## Safety
//!
//! Once a value is chosen for an index, every later round for that index
//! chooses the same value. Acceptors only promise strictly higher
//! generations, and a proposer always re-proposes the highest-generation
//! value it learned during phase 1.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod acceptor;
pub mod config;
pub mod log;
pub mod message;
pub mod proposer;
pub mod replica;
pub mod single;
pub mod state_machine;
pub mod storage;
pub mod types;
pub mod voting;

pub use acceptor::Acceptor;
pub use config::ReplicaConfig;
pub use log::{AppendOutcome, LogMode, PaxosLog};
pub use message::{Envelope, Message, PrepareTarget, Promise, Request, Response};
pub use proposer::Chosen;
pub use replica::{ApplyOutcome, Replica, ReplicaBuilder};
pub use single::SingleValuePaxos;
pub use state_machine::{KvOperation, KvStateMachine, KvView, StateMachine};
pub use storage::{InMemoryPaxosStorage, PaxosStorage, WalPaxosStorage};
pub use types::{LogIndex, PaxosError, PaxosState, Value};
pub use voting::GenerationVoter;
