//! Record framing.
//!
//! ```text
//! [length:u32][crc:u32][index:u64][payload]
//! ```
//!
//! `length` counts the whole record, header included. `crc` is CRC32C over
//! the index bytes followed by the payload. Integers are little-endian.

use serde::{Deserialize, Serialize};

/// Bytes before the payload.
pub const RECORD_HEADER_SIZE: usize = 16;

/// Largest payload accepted by `append` (16 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// One log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Position in the log, strictly increasing.
    pub index: u64,
    /// Opaque record bytes.
    pub payload: Vec<u8>,
}

/// Why bytes could not be read back as a record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// The buffer ends inside the record; a torn tail after a crash.
    #[error("truncated record: {have} of {needed} bytes")]
    InsufficientData {
        /// Bytes the record needs.
        needed: usize,
        /// Bytes left in the buffer.
        have: usize,
    },

    /// The stored checksum does not match index and payload.
    #[error("corrupt record: stored crc {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch {
        /// CRC read from the header.
        expected: u32,
        /// CRC of what was read.
        actual: u32,
    },

    /// Refused at append time.
    #[error("payload of {size} bytes exceeds {MAX_PAYLOAD_SIZE}")]
    RecordTooLarge {
        /// Offending payload length.
        size: usize,
    },

    /// The length header cannot describe a record.
    #[error("bad record length {length}")]
    InvalidLength {
        /// Length read from the header.
        length: u32,
    },
}

fn compute_checksum(index: u64, payload: &[u8]) -> u32 {
    let crc = crc32c::crc32c(&index.to_le_bytes());
    crc32c::crc32c_append(crc, payload)
}

/// Frame one record.
pub(crate) fn encode(index: u64, payload: &[u8]) -> Result<Vec<u8>, RecordError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(RecordError::RecordTooLarge {
            size: payload.len(),
        });
    }

    let total_length = RECORD_HEADER_SIZE + payload.len();
    let mut data = Vec::with_capacity(total_length);
    data.extend_from_slice(&(total_length as u32).to_le_bytes());
    data.extend_from_slice(&compute_checksum(index, payload).to_le_bytes());
    data.extend_from_slice(&index.to_le_bytes());
    data.extend_from_slice(payload);
    Ok(data)
}

/// Deserialize the record at the start of `data`, validating its checksum.
///
/// Returns the entry and the number of bytes it occupied.
pub(crate) fn decode(data: &[u8]) -> Result<(WalEntry, usize), RecordError> {
    if data.len() < RECORD_HEADER_SIZE {
        return Err(RecordError::InsufficientData {
            needed: RECORD_HEADER_SIZE,
            have: data.len(),
        });
    }

    let length = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let expected = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    let index = u64::from_le_bytes([
        data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
    ]);

    let total = length as usize;
    if total < RECORD_HEADER_SIZE || total - RECORD_HEADER_SIZE > MAX_PAYLOAD_SIZE {
        return Err(RecordError::InvalidLength { length });
    }
    if data.len() < total {
        return Err(RecordError::InsufficientData {
            needed: total,
            have: data.len(),
        });
    }

    let payload = &data[RECORD_HEADER_SIZE..total];
    let actual = compute_checksum(index, payload);
    if actual != expected {
        return Err(RecordError::ChecksumMismatch { expected, actual });
    }

    Ok((
        WalEntry {
            index,
            payload: payload.to_vec(),
        },
        total,
    ))
}

/// Every record of a segment, up to the first undecodable byte.
#[derive(Debug)]
pub(crate) struct DecodedSegment {
    pub(crate) entries: Vec<WalEntry>,
    /// Byte length of the valid prefix.
    pub(crate) valid_len: usize,
    /// Why decoding stopped before the end, if it did.
    pub(crate) error: Option<RecordError>,
}

pub(crate) fn decode_all(data: &[u8]) -> DecodedSegment {
    let mut entries = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        match decode(&data[offset..]) {
            Ok((entry, consumed)) => {
                entries.push(entry);
                offset += consumed;
            }
            Err(error) => {
                return DecodedSegment {
                    entries,
                    valid_len: offset,
                    error: Some(error),
                }
            }
        }
    }
    DecodedSegment {
        entries,
        valid_len: offset,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let data = encode(42, b"hello").expect("encode");
        assert_eq!(data.len(), RECORD_HEADER_SIZE + 5);
        assert_eq!(
            u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            data.len() as u32
        );
        assert_eq!(&data[8..16], &42u64.to_le_bytes());
        assert_eq!(&data[16..], b"hello");
    }

    #[test]
    fn test_decode_detects_corruption() {
        let mut data = encode(1, b"payload").expect("encode");
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        assert!(matches!(
            decode(&data),
            Err(RecordError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_detects_index_corruption() {
        let mut data = encode(1, b"payload").expect("encode");
        data[8] = 2;
        assert!(matches!(
            decode(&data),
            Err(RecordError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_all_stops_at_torn_tail() {
        let mut data = encode(1, b"one").expect("encode");
        data.extend(encode(2, b"two").expect("encode"));
        let valid = data.len();
        let torn = encode(3, b"three").expect("encode");
        data.extend_from_slice(&torn[..torn.len() - 2]);

        let decoded = decode_all(&data);
        assert_eq!(decoded.entries.len(), 2);
        assert_eq!(decoded.valid_len, valid);
        assert!(matches!(
            decoded.error,
            Some(RecordError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_rejects_bogus_length() {
        let mut data = encode(1, b"x").expect("encode");
        data[0..4].copy_from_slice(&3u32.to_le_bytes());
        assert!(matches!(
            decode(&data),
            Err(RecordError::InvalidLength { length: 3 })
        ));
    }
}
