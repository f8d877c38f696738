//! # distrib
//!
//! Building blocks for replicated systems: request correlation and quorum
//! aggregation, a checksummed write-ahead log, and Paxos consensus on top.
//!
//! ## Crate Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              distrib (this crate)                           │
//! │   Re-exports every layer                                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  distrib-paxos                                              │
//! │  • Single-value Paxos      • Replicated log (2 modes)       │
//! │  • Generation voting       • Ordered state machine apply    │
//! ├──────────────────────────┬──────────────────────────────────┤
//! │  distrib-transport       │       distrib-wal                │
//! │  • Request waiting list  │       • Segmented, CRC32C log    │
//! │  • Quorum callbacks      │       • WAL-backed KV store      │
//! │  • LocalNetwork          │                                  │
//! ├──────────────────────────┴──────────────────────────────────┤
//! │                     distrib-core                            │
//! │  ReplicaId, GenerationId, Time/Storage/Random providers,    │
//! │  SingularUpdateQueue                                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use distrib::prelude::*;
//!
//! let network = LocalNetwork::new();
//! let config = ReplicaConfig::local_cluster(3).remove(0);
//! let (endpoint, inbound) = network.register(config.id);
//! let replica = Replica::builder(config, TokioTimeProvider::new()).start(endpoint, inbound)?;
//!
//! let log = PaxosLog::new(replica, LogMode::LeaderBased);
//! log.append(KvOperation::Set { key: "k".into(), value: "v".into() }.encode()?).await?;
//! ```
//!
//! ## Which Crate to Use
//!
//! | Use case | Crate |
//! |----------|-------|
//! | Everything | `distrib` |
//! | Identity and provider traits only | `distrib-core` |
//! | Quorum requests over your own transport | `distrib-transport` |
//! | Durable append-only log | `distrib-wal` |
//! | Consensus | `distrib-paxos` |

#![deny(missing_docs)]

pub use distrib_core as core;
pub use distrib_paxos as paxos;
pub use distrib_transport as transport;
pub use distrib_wal as wal;

/// The types most programs need.
pub mod prelude {
    pub use distrib_core::{
        FsStorageProvider, GenerationId, MemoryStorageProvider, ReplicaId, StorageProvider,
        TimeProvider, TokioTimeProvider,
    };
    pub use distrib_paxos::{
        KvOperation, KvStateMachine, LogIndex, LogMode, PaxosError, PaxosLog, Replica,
        ReplicaConfig, SingleValuePaxos, StateMachine, WalPaxosStorage,
    };
    pub use distrib_transport::{LocalNetwork, Network, WaitingListConfig};
    pub use distrib_wal::{WalConfig, WriteAheadLog};
}
