//! Paxos storage trait and its implementations.
//!
//! The [`PaxosStorage`] trait abstracts the durable state of an acceptor:
//!
//! - **floor**: the generation promised by the last full-log prepare. It
//!   applies to every index, including indices never written. Generation
//!   voting reuses it as its watermark.
//! - **slots**: one [`PaxosState`] per register.
//!
//! [`InMemoryPaxosStorage`] loses everything on drop, which is what tests of
//! crash-without-disk scenarios want. [`WalPaxosStorage`] writes every change
//! to a [`WriteAheadLog`] before returning and replays it on open, the last
//! record for a slot winning.
//!
//! ## Compaction
//!
//! Superseded records pile up in the log. Once the records written since the
//! last compaction outnumber both the configured threshold and the live state,
//! [`WalPaxosStorage`] rewrites the live state into a fresh segment and deletes
//! every older segment. Replay stays last-record-wins, so a crash between the
//! rewrite and the deletion only leaves duplicates behind.

use std::collections::BTreeMap;

use distrib_core::{GenerationId, StorageProvider};
use distrib_wal::{WalConfig, WriteAheadLog};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{LogIndex, PaxosError, PaxosState};

/// Trait for persistent Paxos state storage.
///
/// Implementations must make writes durable before returning.
pub trait PaxosStorage: Send {
    /// Load the full-log promise floor, [`GenerationId::ZERO`] if never set.
    fn load_floor(&self) -> Result<GenerationId, PaxosError>;

    /// Store the full-log promise floor.
    fn store_floor(&mut self, floor: GenerationId) -> Result<(), PaxosError>;

    /// Load the state of one register.
    fn load_slot(&self, index: LogIndex) -> Result<Option<PaxosState>, PaxosError>;

    /// Store the state of one register.
    fn store_slot(&mut self, index: LogIndex, state: PaxosState) -> Result<(), PaxosError>;

    /// Load every register at or after `from`, in index order.
    fn load_slots_from(&self, from: LogIndex)
        -> Result<BTreeMap<LogIndex, PaxosState>, PaxosError>;

    /// Highest index with any stored state.
    fn highest_index(&self) -> Result<Option<LogIndex>, PaxosError>;
}

impl<S: PaxosStorage + ?Sized> PaxosStorage for Box<S> {
    fn load_floor(&self) -> Result<GenerationId, PaxosError> {
        (**self).load_floor()
    }

    fn store_floor(&mut self, floor: GenerationId) -> Result<(), PaxosError> {
        (**self).store_floor(floor)
    }

    fn load_slot(&self, index: LogIndex) -> Result<Option<PaxosState>, PaxosError> {
        (**self).load_slot(index)
    }

    fn store_slot(&mut self, index: LogIndex, state: PaxosState) -> Result<(), PaxosError> {
        (**self).store_slot(index, state)
    }

    fn load_slots_from(
        &self,
        from: LogIndex,
    ) -> Result<BTreeMap<LogIndex, PaxosState>, PaxosError> {
        (**self).load_slots_from(from)
    }

    fn highest_index(&self) -> Result<Option<LogIndex>, PaxosError> {
        (**self).highest_index()
    }
}

/// In-memory implementation of [`PaxosStorage`].
#[derive(Debug, Default)]
pub struct InMemoryPaxosStorage {
    floor: GenerationId,
    slots: BTreeMap<LogIndex, PaxosState>,
}

impl InMemoryPaxosStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PaxosStorage for InMemoryPaxosStorage {
    fn load_floor(&self) -> Result<GenerationId, PaxosError> {
        Ok(self.floor)
    }

    fn store_floor(&mut self, floor: GenerationId) -> Result<(), PaxosError> {
        self.floor = floor;
        Ok(())
    }

    fn load_slot(&self, index: LogIndex) -> Result<Option<PaxosState>, PaxosError> {
        Ok(self.slots.get(&index).cloned())
    }

    fn store_slot(&mut self, index: LogIndex, state: PaxosState) -> Result<(), PaxosError> {
        self.slots.insert(index, state);
        Ok(())
    }

    fn load_slots_from(
        &self,
        from: LogIndex,
    ) -> Result<BTreeMap<LogIndex, PaxosState>, PaxosError> {
        Ok(self
            .slots
            .range(from..)
            .map(|(index, state)| (*index, state.clone()))
            .collect())
    }

    fn highest_index(&self) -> Result<Option<LogIndex>, PaxosError> {
        Ok(self.slots.keys().next_back().copied())
    }
}

/// One logged state transition.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StorageRecord {
    Floor { generation: GenerationId },
    Slot { index: LogIndex, state: PaxosState },
}

/// Default number of records written between compactions.
pub const DEFAULT_COMPACT_AFTER: usize = 10_000;

/// [`PaxosStorage`] persisted to a write-ahead log.
///
/// Reads are served from an in-memory mirror rebuilt on open.
pub struct WalPaxosStorage<P: StorageProvider> {
    wal: WriteAheadLog<P>,
    mirror: InMemoryPaxosStorage,
    compact_after: usize,
    since_compaction: usize,
}

impl<P: StorageProvider> WalPaxosStorage<P> {
    /// Open the log in `config.directory` and replay it.
    pub fn open(storage: P, config: WalConfig) -> Result<Self, PaxosError> {
        let wal = WriteAheadLog::open(storage, config)?;
        let mut mirror = InMemoryPaxosStorage::new();
        let entries = wal.read_all()?;
        for entry in &entries {
            match serde_json::from_slice(&entry.payload)? {
                StorageRecord::Floor { generation } => mirror.floor = generation,
                StorageRecord::Slot { index, state } => {
                    mirror.slots.insert(index, state);
                }
            }
        }
        info!(
            records = entries.len(),
            slots = mirror.slots.len(),
            floor = %mirror.floor,
            "paxos storage recovered"
        );
        Ok(Self {
            wal,
            mirror,
            compact_after: DEFAULT_COMPACT_AFTER,
            since_compaction: entries.len(),
        })
    }

    /// Compact once this many records were written since the last compaction.
    pub fn with_compact_after(mut self, records: usize) -> Self {
        self.compact_after = records.max(1);
        self
    }

    /// Flush and close the underlying log.
    pub fn close(&mut self) -> Result<(), PaxosError> {
        Ok(self.wal.close()?)
    }

    /// Rewrite the live state into a new segment and drop older segments.
    pub fn compact(&mut self) -> Result<(), PaxosError> {
        self.wal.start_new_segment()?;
        let start = self.wal.last_index() + 1;

        append_record(
            &mut self.wal,
            &StorageRecord::Floor {
                generation: self.mirror.floor,
            },
        )?;
        for (index, state) in &self.mirror.slots {
            append_record(
                &mut self.wal,
                &StorageRecord::Slot {
                    index: *index,
                    state: state.clone(),
                },
            )?;
        }

        let removed = self.wal.remove_segments_before(start)?;
        info!(
            slots = self.mirror.slots.len(),
            superseded = self.since_compaction,
            segments_removed = removed,
            "compacted paxos storage"
        );
        self.since_compaction = 0;
        Ok(())
    }

    fn log(&mut self, record: &StorageRecord) -> Result<(), PaxosError> {
        append_record(&mut self.wal, record)?;
        self.since_compaction += 1;
        Ok(())
    }

    /// Runs after the mirror is updated, so the rewrite includes the change
    /// just logged.
    fn maybe_compact(&mut self) {
        let live = self.mirror.slots.len() + 1;
        if self.since_compaction < self.compact_after.max(live) {
            return;
        }
        // The triggering write is already durable; a failure here surfaces
        // on the next write.
        if let Err(err) = self.compact() {
            warn!(error = %err, "paxos storage compaction failed");
        }
    }
}

fn append_record<P: StorageProvider>(
    wal: &mut WriteAheadLog<P>,
    record: &StorageRecord,
) -> Result<(), PaxosError> {
    let payload = serde_json::to_vec(record)?;
    wal.append(&payload)?;
    Ok(())
}

impl<P: StorageProvider> PaxosStorage for WalPaxosStorage<P> {
    fn load_floor(&self) -> Result<GenerationId, PaxosError> {
        self.mirror.load_floor()
    }

    fn store_floor(&mut self, floor: GenerationId) -> Result<(), PaxosError> {
        self.log(&StorageRecord::Floor { generation: floor })?;
        self.mirror.store_floor(floor)?;
        self.maybe_compact();
        Ok(())
    }

    fn load_slot(&self, index: LogIndex) -> Result<Option<PaxosState>, PaxosError> {
        self.mirror.load_slot(index)
    }

    fn store_slot(&mut self, index: LogIndex, state: PaxosState) -> Result<(), PaxosError> {
        self.log(&StorageRecord::Slot {
            index,
            state: state.clone(),
        })?;
        self.mirror.store_slot(index, state)?;
        self.maybe_compact();
        Ok(())
    }

    fn load_slots_from(
        &self,
        from: LogIndex,
    ) -> Result<BTreeMap<LogIndex, PaxosState>, PaxosError> {
        self.mirror.load_slots_from(from)
    }

    fn highest_index(&self) -> Result<Option<LogIndex>, PaxosError> {
        self.mirror.highest_index()
    }
}
