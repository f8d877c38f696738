//! Key/value store made durable by the write-ahead log.
//!
//! Writes go through a [`SingularUpdateQueue`], whose single worker owns the
//! log. For each `put` the worker appends the command to the log first and
//! only then applies it to the in-memory map. Reads never touch the log.
//!
//! Opening the store replays the log through [`apply`], the same function the
//! worker uses, so recovered state is exactly the state before the crash.
//!
//! A failed append is fatal for the store: it is marked failed and every later
//! write is refused rather than risking acknowledged-but-lost data.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use distrib_core::{
    QueueConfig, QueueError, SingularUpdateQueue, StorageProvider, TaskError, UpdateHandler,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::wal::{WalConfig, WalError, WriteAheadLog};

/// A logged mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KvCommand {
    /// Set `key` to `value`.
    Set {
        /// Key to write.
        key: String,
        /// New value.
        value: String,
    },
}

/// Errors from the key/value store.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// The log could not persist the write. The store is now failed.
    #[error("durability failure: {0}")]
    Durability(#[source] WalError),

    /// An earlier durability failure made the store refuse writes.
    #[error("store failed earlier, refusing writes")]
    Failed,

    /// Opening or closing the log failed.
    #[error("wal error: {0}")]
    Wal(#[from] WalError),

    /// A logged command could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The write queue rejected the request.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// The writer panicked while applying the request.
    #[error("writer panicked")]
    WriterPanicked,

    /// The store closed before the request was processed.
    #[error("store closed")]
    Closed,
}

impl From<TaskError<KvError>> for KvError {
    fn from(err: TaskError<KvError>) -> Self {
        match err {
            TaskError::Handler(err) => err,
            TaskError::Panicked => KvError::WriterPanicked,
            TaskError::Abandoned => KvError::Closed,
        }
    }
}

type KvMap = BTreeMap<String, String>;

/// Apply one command to the map. Shared by replay and live writes.
fn apply(map: &mut KvMap, command: KvCommand) {
    match command {
        KvCommand::Set { key, value } => {
            map.insert(key, value);
        }
    }
}

struct KvWriter<P: StorageProvider> {
    wal: WriteAheadLog<P>,
    map: Arc<RwLock<KvMap>>,
    failed: Arc<AtomicBool>,
}

impl<P: StorageProvider> UpdateHandler for KvWriter<P> {
    type Request = KvCommand;
    type Response = u64;
    type Error = KvError;

    fn handle(&mut self, command: KvCommand) -> Result<u64, KvError> {
        if self.failed.load(Ordering::Acquire) {
            return Err(KvError::Failed);
        }
        let payload = serde_json::to_vec(&command)?;
        let index = match self.wal.append(&payload) {
            Ok(index) => index,
            Err(err) => {
                self.failed.store(true, Ordering::Release);
                error!(error = %err, "kv store lost durability, refusing further writes");
                return Err(KvError::Durability(err));
            }
        };
        apply(&mut self.map.write(), command);
        Ok(index)
    }
}

/// Key/value map whose writes are logged before they become visible.
pub struct WalBackedKvStore<P: StorageProvider> {
    map: Arc<RwLock<KvMap>>,
    failed: Arc<AtomicBool>,
    writer: SingularUpdateQueue<KvWriter<P>>,
}

impl<P: StorageProvider> WalBackedKvStore<P> {
    /// Open the store, replaying whatever the log already holds.
    pub fn open(storage: P, wal_config: WalConfig) -> Result<Self, KvError> {
        Self::open_with(storage, wal_config, QueueConfig::default().with_name("kv-writer"))
    }

    /// Open the store with an explicit write-queue configuration.
    pub fn open_with(
        storage: P,
        wal_config: WalConfig,
        queue_config: QueueConfig,
    ) -> Result<Self, KvError> {
        let wal = WriteAheadLog::open(storage, wal_config)?;

        let mut map = KvMap::new();
        let entries = wal.read_all()?;
        for entry in &entries {
            let command: KvCommand = serde_json::from_slice(&entry.payload)?;
            apply(&mut map, command);
        }
        info!(replayed = entries.len(), keys = map.len(), "kv store recovered");

        let map = Arc::new(RwLock::new(map));
        let failed = Arc::new(AtomicBool::new(false));
        let writer = SingularUpdateQueue::start(
            KvWriter {
                wal,
                map: map.clone(),
                failed: failed.clone(),
            },
            queue_config,
        )?;

        Ok(Self {
            map,
            failed,
            writer,
        })
    }

    /// Queue a write and return without waiting for it.
    pub fn submit_put(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<distrib_core::CompletionHandle<u64, KvError>, KvError> {
        if self.failed.load(Ordering::Acquire) {
            return Err(KvError::Failed);
        }
        Ok(self.writer.submit(KvCommand::Set {
            key: key.into(),
            value: value.into(),
        })?)
    }

    /// Write `key`, returning the log index once the write is durable.
    pub async fn put(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<u64, KvError> {
        Ok(self.submit_put(key, value)?.await?)
    }

    /// Blocking variant of [`put`](Self::put) for plain threads.
    pub fn put_blocking(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<u64, KvError> {
        Ok(self.submit_put(key, value)?.wait()?)
    }

    /// Read `key` from memory.
    pub fn get(&self, key: &str) -> Option<String> {
        self.map.read().get(key).cloned()
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Whether a durability failure made the store refuse writes.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Stop the writer and close the log.
    pub fn close(self) -> Result<(), KvError> {
        let mut writer = self.writer.shutdown().ok_or(KvError::WriterPanicked)?;
        writer.wal.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use distrib_core::MemoryStorageProvider;

    fn open(storage: &MemoryStorageProvider) -> WalBackedKvStore<MemoryStorageProvider> {
        WalBackedKvStore::open(storage.clone(), WalConfig::new("/kv")).expect("open")
    }

    #[test]
    fn test_put_then_get() {
        let storage = MemoryStorageProvider::new();
        let store = open(&storage);

        assert_eq!(store.put_blocking("k", "v1").expect("put"), 1);
        assert_eq!(store.put_blocking("k", "v2").expect("put"), 2);
        assert_eq!(store.get("k").as_deref(), Some("v2"));
        assert_eq!(store.get("missing"), None);
        assert_eq!(store.len(), 1);
        store.close().expect("close");
    }

    #[test]
    fn test_replay_rebuilds_last_write() {
        let storage = MemoryStorageProvider::new();
        let store = open(&storage);
        store.put_blocking("a", "1").expect("put");
        store.put_blocking("b", "2").expect("put");
        store.put_blocking("a", "3").expect("put");
        store.close().expect("close");

        let store = open(&storage);
        assert_eq!(store.get("a").as_deref(), Some("3"));
        assert_eq!(store.get("b").as_deref(), Some("2"));
        assert_eq!(store.put_blocking("c", "4").expect("put"), 4);
    }

    #[test]
    fn test_durability_failure_is_fatal() {
        let storage = MemoryStorageProvider::new();
        let store = open(&storage);
        store.put_blocking("before", "ok").expect("put");

        storage.fail_syncs(true);
        let err = store.put_blocking("during", "lost").expect_err("should fail");
        assert!(matches!(err, KvError::Durability(_)));
        assert!(store.is_failed());
        // Not applied: the log never confirmed it.
        assert_eq!(store.get("during"), None);

        storage.fail_syncs(false);
        assert!(matches!(
            store.put_blocking("after", "refused"),
            Err(KvError::Failed)
        ));
        assert_eq!(store.get("before").as_deref(), Some("ok"));
    }

    #[test]
    fn test_corrupt_command_fails_open() {
        let storage = MemoryStorageProvider::new();
        {
            let mut wal =
                WriteAheadLog::open(storage.clone(), WalConfig::new("/kv")).expect("open");
            wal.append(b"not json").expect("append");
            wal.close().expect("close");
        }
        let err = WalBackedKvStore::open(storage, WalConfig::new("/kv"))
            .err()
            .expect("should fail");
        assert!(matches!(err, KvError::Codec(_)));
    }

    #[test]
    fn test_command_encoding_is_tagged() {
        let json = serde_json::to_string(&KvCommand::Set {
            key: "k".into(),
            value: "v".into(),
        })
        .expect("serialize");
        assert_eq!(json, r#"{"kind":"set","key":"k","value":"v"}"#);
    }
}
