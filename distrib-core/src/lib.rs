//! # distrib-core
//!
//! Core abstractions shared by every distrib crate.
//!
//! - **Identity**: [`ReplicaId`] names a replica, [`GenerationId`] orders
//!   competing proposals and leaders.
//! - **Provider traits**: [`TimeProvider`] and [`StorageProvider`] are injected
//!   at construction so components never reach for an ambient clock or the
//!   filesystem directly. Each comes with a production implementation and a
//!   controllable one for tests.
//! - **Serialization of mutations**: [`SingularUpdateQueue`] funnels every
//!   mutation of a piece of state through one dedicated worker.
//!
//! ## Provider Implementations
//!
//! | Trait | Production | Tests |
//! |---|---|---|
//! | [`TimeProvider`] | [`TokioTimeProvider`] | [`ManualTimeProvider`] |
//! | [`StorageProvider`] | [`FsStorageProvider`] | [`MemoryStorageProvider`] |
//! | [`RandomProvider`] | [`ThreadRandomProvider`] | any seeded impl |

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod generation;
mod random;
mod storage;
mod time;
mod update_queue;

pub use generation::{GenerationId, ReplicaId};
pub use random::{RandomProvider, ThreadRandomProvider};
pub use storage::{
    FsStorageProvider, MemoryStorageFile, MemoryStorageProvider, OpenOptions, StorageFile,
    StorageProvider,
};
pub use time::{ManualTimeProvider, TimeError, TimeProvider, TokioTimeProvider};
pub use update_queue::{
    handler_fn, CompletionHandle, FnHandler, QueueConfig, QueueError, SingularUpdateQueue,
    TaskError, UpdateHandler,
};
