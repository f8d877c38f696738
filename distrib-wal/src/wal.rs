//! Segmented write-ahead log.
//!
//! Records are appended to the newest segment file. Once a segment would grow
//! past [`WalConfig::max_segment_bytes`] a new one is started, named after the
//! index of its first record so segments sort by name.
//!
//! ## Durability
//!
//! [`append`](WriteAheadLog::append) returns only after the record has been
//! written and synced. Any I/O failure on the write path moves the log into a
//! failed state: durability can no longer be promised, so every later append
//! is refused with [`WalError::Failed`].
//!
//! ## Recovery
//!
//! On [`open`](WriteAheadLog::open) every segment is decoded. A torn or
//! corrupt tail in the newest segment (a crash mid-append) is cut off. The
//! same damage in an older segment is a hard error.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use distrib_core::{OpenOptions, StorageFile, StorageProvider};
use tracing::{debug, error, info, warn};

use crate::record::{self, decode_all, RecordError, WalEntry};

/// Configuration for a [`WriteAheadLog`].
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory holding the segment files.
    pub directory: PathBuf,
    /// Size after which a new segment is started.
    pub max_segment_bytes: u64,
    /// Sync every append before returning.
    pub sync_on_append: bool,
}

impl WalConfig {
    /// Configuration with defaults for `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            max_segment_bytes: 64 * 1024 * 1024,
            sync_on_append: true,
        }
    }

    /// Set the segment size limit.
    pub fn with_max_segment_bytes(mut self, bytes: u64) -> Self {
        self.max_segment_bytes = bytes;
        self
    }

    /// Enable or disable syncing on every append.
    pub fn with_sync_on_append(mut self, sync: bool) -> Self {
        self.sync_on_append = sync;
        self
    }
}

/// Errors from the write-ahead log.
#[derive(Debug, thiserror::Error)]
pub enum WalError {
    /// Underlying storage failed.
    #[error("wal I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be framed.
    #[error("wal record error: {0}")]
    Record(#[from] RecordError),

    /// A segment other than the newest is damaged.
    #[error("corrupt segment {segment}: {source}")]
    Corrupt {
        /// Segment path.
        segment: String,
        /// Decoding failure.
        #[source]
        source: RecordError,
    },

    /// Record indices are not strictly increasing.
    #[error("out-of-order record {index} in {segment}, expected at least {expected}")]
    OutOfOrder {
        /// Segment path.
        segment: String,
        /// Offending index.
        index: u64,
        /// Lowest acceptable index.
        expected: u64,
    },

    /// A previous write failed; the log refuses further writes.
    #[error("wal failed earlier, refusing writes")]
    Failed,

    /// The log has been closed.
    #[error("wal closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogState {
    Open,
    Failed,
    Closed,
}

#[derive(Debug)]
struct Segment {
    base: u64,
    path: PathBuf,
}

struct ActiveSegment<F> {
    file: F,
    size: u64,
}

fn segment_path(directory: &Path, base: u64) -> PathBuf {
    directory.join(format!("wal_{base}.log"))
}

fn segment_base(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix("wal_")?
        .strip_suffix(".log")?
        .parse()
        .ok()
}

/// Append-only, segmented, checksummed log over a [`StorageProvider`].
pub struct WriteAheadLog<P: StorageProvider> {
    storage: P,
    config: WalConfig,
    segments: Vec<Segment>,
    active: Option<ActiveSegment<P::File>>,
    next_index: u64,
    state: LogState,
}

impl<P: StorageProvider> WriteAheadLog<P> {
    /// Open (or create) the log in `config.directory`, recovering existing
    /// segments.
    pub fn open(storage: P, config: WalConfig) -> Result<Self, WalError> {
        storage.create_dir_all(&config.directory)?;

        let mut segments: Vec<Segment> = storage
            .list(&config.directory)?
            .into_iter()
            .filter_map(|path| segment_base(&path).map(|base| Segment { base, path }))
            .collect();
        segments.sort_by_key(|segment| segment.base);

        let mut next_index = 1;
        let newest = segments.len().checked_sub(1);
        for (position, segment) in segments.iter().enumerate() {
            let data = read_file(&storage, &segment.path)?;
            let decoded = decode_all(&data);

            if let Some(source) = decoded.error {
                if Some(position) != newest {
                    return Err(WalError::Corrupt {
                        segment: segment.path.display().to_string(),
                        source,
                    });
                }
                warn!(
                    segment = %segment.path.display(),
                    valid_len = decoded.valid_len,
                    error = %source,
                    "truncating damaged tail of newest segment"
                );
                let file = storage.open(&segment.path, OpenOptions::new().write(true))?;
                file.set_len(decoded.valid_len as u64)?;
                file.sync_all()?;
            }

            next_index = next_index.max(segment.base);
            for entry in &decoded.entries {
                if entry.index < next_index {
                    return Err(WalError::OutOfOrder {
                        segment: segment.path.display().to_string(),
                        index: entry.index,
                        expected: next_index,
                    });
                }
                next_index = entry.index + 1;
            }
        }

        let active = match segments.last() {
            Some(segment) => {
                let file = storage.open(&segment.path, OpenOptions::create_append())?;
                let size = file.size()?;
                Some(ActiveSegment { file, size })
            }
            None => None,
        };

        info!(
            directory = %config.directory.display(),
            segments = segments.len(),
            next_index,
            "opened write-ahead log"
        );

        Ok(Self {
            storage,
            config,
            segments,
            active,
            next_index,
            state: LogState::Open,
        })
    }

    /// Append a record and return its index once it is durable.
    pub fn append(&mut self, payload: &[u8]) -> Result<u64, WalError> {
        self.ensure_writable()?;
        let index = self.next_index;
        let record = record::encode(index, payload)?;

        if let Err(err) = self.write_record(index, &record) {
            self.state = LogState::Failed;
            error!(index, error = %err, "wal append failed, log is no longer writable");
            return Err(err);
        }
        self.next_index += 1;
        Ok(index)
    }

    fn write_record(&mut self, index: u64, record: &[u8]) -> Result<(), WalError> {
        let len = record.len() as u64;
        let roll = match &self.active {
            None => true,
            Some(active) => {
                active.size > 0 && active.size + len > self.config.max_segment_bytes
            }
        };
        if roll {
            self.roll(index)?;
        }

        let active = self.active.as_mut().ok_or(WalError::Closed)?;
        active.file.write_all(record)?;
        if self.config.sync_on_append {
            active.file.sync_data()?;
        }
        active.size += len;
        Ok(())
    }

    fn roll(&mut self, base: u64) -> Result<(), WalError> {
        if let Some(active) = self.active.take() {
            active.file.sync_all()?;
        }
        let path = segment_path(&self.config.directory, base);
        let file = self.storage.open(&path, OpenOptions::create_append())?;
        let size = file.size()?;
        info!(segment = %path.display(), "started new wal segment");
        self.segments.push(Segment { base, path });
        self.active = Some(ActiveSegment { file, size });
        Ok(())
    }

    /// Every record, in index order.
    pub fn read_all(&self) -> Result<Vec<WalEntry>, WalError> {
        self.read_from(0)
    }

    /// Every record with `index >= from`, in index order.
    pub fn read_from(&self, from: u64) -> Result<Vec<WalEntry>, WalError> {
        if self.state == LogState::Closed {
            return Err(WalError::Closed);
        }

        let mut entries = Vec::new();
        for (position, segment) in self.segments.iter().enumerate() {
            // Skip segments that end before `from`.
            if let Some(next) = self.segments.get(position + 1) {
                if next.base <= from {
                    continue;
                }
            }
            let data = read_file(&self.storage, &segment.path)?;
            let decoded = decode_all(&data);
            if let Some(source) = decoded.error {
                return Err(WalError::Corrupt {
                    segment: segment.path.display().to_string(),
                    source,
                });
            }
            entries.extend(decoded.entries.into_iter().filter(|e| e.index >= from));
        }
        Ok(entries)
    }

    /// Drop every record with `index >= from`. The next append reuses `from`.
    pub fn truncate(&mut self, from: u64) -> Result<(), WalError> {
        self.ensure_writable()?;
        if from >= self.next_index {
            return Ok(());
        }

        self.active = None;
        while self.segments.last().is_some_and(|segment| segment.base >= from) {
            if let Some(segment) = self.segments.pop() {
                self.storage.delete(&segment.path)?;
                debug!(segment = %segment.path.display(), "deleted truncated segment");
            }
        }

        if let Some(segment) = self.segments.last() {
            let data = read_file(&self.storage, &segment.path)?;
            let mut keep = 0;
            while keep < data.len() {
                let (entry, consumed) = record::decode(&data[keep..])?;
                if entry.index >= from {
                    break;
                }
                keep += consumed;
            }

            let file = self
                .storage
                .open(&segment.path, OpenOptions::new().write(true))?;
            file.set_len(keep as u64)?;
            file.sync_all()?;
            drop(file);

            let file = self
                .storage
                .open(&segment.path, OpenOptions::create_append())?;
            self.active = Some(ActiveSegment {
                file,
                size: keep as u64,
            });
        }

        info!(from, "truncated write-ahead log");
        self.next_index = from.max(1);
        Ok(())
    }

    /// Seal the active segment so the next append starts a new one.
    ///
    /// A no-op when the active segment is still empty.
    pub fn start_new_segment(&mut self) -> Result<(), WalError> {
        self.ensure_writable()?;
        if self.active.as_ref().is_some_and(|active| active.size > 0) {
            self.roll(self.next_index)?;
        }
        Ok(())
    }

    /// Delete every segment whose records all have `index < before`.
    ///
    /// The newest segment always stays. Returns the number of segments
    /// deleted.
    pub fn remove_segments_before(&mut self, before: u64) -> Result<usize, WalError> {
        self.ensure_writable()?;
        let mut removed = 0;
        // A segment lies wholly below `before` once its successor starts there.
        while self.segments.len() > 1 && self.segments[1].base <= before {
            let segment = self.segments.remove(0);
            self.storage.delete(&segment.path)?;
            debug!(segment = %segment.path.display(), "deleted cleaned segment");
            removed += 1;
        }
        if removed > 0 {
            info!(before, removed, "cleaned write-ahead log");
        }
        Ok(removed)
    }

    /// Index of the newest record, 0 when empty.
    pub fn last_index(&self) -> u64 {
        self.next_index - 1
    }

    /// Number of segment files.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Whether a previous write failure made the log read-only.
    pub fn is_failed(&self) -> bool {
        self.state == LogState::Failed
    }

    /// Sync and release the active segment. Later calls are no-ops.
    pub fn close(&mut self) -> Result<(), WalError> {
        if self.state == LogState::Closed {
            return Ok(());
        }
        let active = self.active.take();
        self.state = LogState::Closed;
        if let Some(active) = active {
            active.file.sync_all()?;
        }
        debug!(directory = %self.config.directory.display(), "closed write-ahead log");
        Ok(())
    }

    fn ensure_writable(&self) -> Result<(), WalError> {
        match self.state {
            LogState::Open => Ok(()),
            LogState::Failed => Err(WalError::Failed),
            LogState::Closed => Err(WalError::Closed),
        }
    }
}

fn read_file<P: StorageProvider>(storage: &P, path: &Path) -> Result<Vec<u8>, WalError> {
    let mut file = storage.open(path, OpenOptions::read_only())?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    Ok(data)
}
