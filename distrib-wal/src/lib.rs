//! # distrib-wal
//!
//! Durable, strictly ordered, append-only storage of opaque records.
//!
//! - [`WriteAheadLog`]: segmented log files, every record checksummed and
//!   synced before [`append`](WriteAheadLog::append) returns.
//! - [`WalBackedKvStore`]: a key/value map whose writes go to the log first
//!   and whose state is rebuilt on open by replaying the log through the same
//!   apply function used for live writes.
//!
//! ## On-disk layout
//!
//! ```text
//! <directory>/wal_<first-index>.log
//!   [length:4][checksum:4][index:8][payload:N] ...
//! ```
//!
//! All integers are little-endian. The checksum is CRC32C of index + payload.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod kv;
mod record;
mod wal;

pub use kv::{KvCommand, KvError, WalBackedKvStore};
pub use record::{RecordError, WalEntry, MAX_PAYLOAD_SIZE, RECORD_HEADER_SIZE};
pub use wal::{WalConfig, WalError, WriteAheadLog};
