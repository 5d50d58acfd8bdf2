//! Fixed-layout binary formats for log records and hint records.
//!
//! Log record (big-endian):
//!
//! ```text
//! crc32(4) | timestamp_f64(8) | keysize_u16(2) | valuesize_u32(4) | key | value
//! ```
//!
//! The CRC covers everything after itself. Hint record:
//!
//! ```text
//! timestamp_f64(8) | keysize_u16(2) | totalsize_u32(4) | recordoffset_f64(8) | key
//! ```
//!
//! `totalsize` is the full length of the matching log record and
//! `recordoffset` is where that record starts in the data file.

use crc::{Crc, CRC_32_ISO_HDLC};
use thiserror::Error;

pub const CRC_SIZE: usize = 4;
pub const TIMESTAMP_SIZE: usize = 8;
pub const KEY_SIZE_LEN: usize = 2;
pub const VALUE_SIZE_LEN: usize = 4;
pub const HEADER_SIZE: usize = CRC_SIZE + TIMESTAMP_SIZE + KEY_SIZE_LEN + VALUE_SIZE_LEN;

const TIMESTAMP_OFFSET: usize = CRC_SIZE;
const KEY_SIZE_OFFSET: usize = TIMESTAMP_OFFSET + TIMESTAMP_SIZE;
const VALUE_SIZE_OFFSET: usize = KEY_SIZE_OFFSET + KEY_SIZE_LEN;

const TOTAL_SIZE_LEN: usize = 4;
const RECORD_OFFSET_LEN: usize = 8;
pub const HINT_HEADER_SIZE: usize =
    TIMESTAMP_SIZE + KEY_SIZE_LEN + TOTAL_SIZE_LEN + RECORD_OFFSET_LEN;

pub const MAX_KEY_SIZE: usize = u16::MAX as usize;
pub const MAX_VALUE_SIZE: usize = u32::MAX as usize - HEADER_SIZE - MAX_KEY_SIZE;

/// Value that marks a key as deleted.
pub const TOMBSTONE: &[u8] = b"medea_tombstone";

pub(crate) const CRC_CALCULATOR: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Running checksum for hint streams; a `static` so digests can live in `LogFile`.
pub(crate) static HINT_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("buffer holds {actual} bytes, frame needs {needed}")]
    Truncated { needed: usize, actual: usize },

    #[error("CRC mismatch: stored 0x{stored:08x}, computed 0x{computed:08x}")]
    BadCrc { stored: u32, computed: u32 },

    #[error("total size {total} is smaller than header plus key ({minimum})")]
    BadTotalSize { total: u32, minimum: usize },
}

pub fn is_tombstone(value: &[u8]) -> bool {
    value == TOMBSTONE
}

/// The fixed 18-byte prefix of a log record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordHeader {
    pub crc: u32,
    pub timestamp: f64,
    pub key_size: u16,
    pub value_size: u32,
}

impl RecordHeader {
    /// Reads a header from the first `HEADER_SIZE` bytes of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_SIZE {
            return Err(FrameError::Truncated {
                needed: HEADER_SIZE,
                actual: buf.len(),
            });
        }
        Ok(RecordHeader {
            crc: u32::from_be_bytes(read_array(buf, 0)),
            timestamp: f64::from_be_bytes(read_array(buf, TIMESTAMP_OFFSET)),
            key_size: u16::from_be_bytes(read_array(buf, KEY_SIZE_OFFSET)),
            value_size: u32::from_be_bytes(read_array(buf, VALUE_SIZE_OFFSET)),
        })
    }

    /// Length of the whole record this header starts.
    pub fn record_len(&self) -> u64 {
        HEADER_SIZE as u64 + self.key_size as u64 + self.value_size as u64
    }
}

/// A log record decoded in place from a buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Record<'a> {
    pub header: RecordHeader,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

impl<'a> Record<'a> {
    pub fn timestamp(&self) -> f64 {
        self.header.timestamp
    }

    pub fn is_tombstone(&self) -> bool {
        is_tombstone(self.value)
    }

    pub fn len(&self) -> usize {
        HEADER_SIZE + self.key.len() + self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == HEADER_SIZE
    }
}

/// Appends one encoded record to `buf` and returns its length.
pub fn encode_record_into(buf: &mut Vec<u8>, key: &[u8], value: &[u8], timestamp: f64) -> usize {
    let start = buf.len();
    buf.extend_from_slice(&[0u8; CRC_SIZE]);
    buf.extend_from_slice(&timestamp.to_be_bytes());
    buf.extend_from_slice(&(key.len() as u16).to_be_bytes());
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);

    let crc = CRC_CALCULATOR.checksum(&buf[start + CRC_SIZE..]);
    buf[start..start + CRC_SIZE].copy_from_slice(&crc.to_be_bytes());
    buf.len() - start
}

pub fn encode_record(key: &[u8], value: &[u8], timestamp: f64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + key.len() + value.len());
    encode_record_into(&mut buf, key, value, timestamp);
    buf
}

/// Decodes the record at the front of `buf` and checks its CRC.
///
/// The buffer must already hold the full header, key and value; trailing
/// bytes beyond the record are ignored.
pub fn decode_record(buf: &[u8]) -> Result<Record<'_>, FrameError> {
    let header = RecordHeader::parse(buf)?;
    let len = header.record_len() as usize;
    if buf.len() < len {
        return Err(FrameError::Truncated {
            needed: len,
            actual: buf.len(),
        });
    }

    let computed = CRC_CALCULATOR.checksum(&buf[CRC_SIZE..len]);
    if computed != header.crc {
        return Err(FrameError::BadCrc {
            stored: header.crc,
            computed,
        });
    }

    let key_end = HEADER_SIZE + header.key_size as usize;
    Ok(Record {
        header,
        key: &buf[HEADER_SIZE..key_end],
        value: &buf[key_end..len],
    })
}

/// A hint record decoded in place from a buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HintEntry<'a> {
    pub timestamp: f64,
    pub key_size: u16,
    pub total_size: u32,
    pub record_offset: u64,
    pub key: &'a [u8],
}

impl HintEntry<'_> {
    pub fn value_size(&self) -> u32 {
        self.total_size - HEADER_SIZE as u32 - self.key_size as u32
    }

    pub fn value_position(&self) -> u64 {
        self.record_offset + HEADER_SIZE as u64 + self.key_size as u64
    }

    pub fn len(&self) -> usize {
        HINT_HEADER_SIZE + self.key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }
}

/// Derives a hint record from the bytes of a record that was just written at
/// `record_offset`, without re-encoding the record. Returns the hint length.
pub fn encode_hint_into(buf: &mut Vec<u8>, record: &[u8], record_offset: u64) -> usize {
    let start = buf.len();
    let key_size = u16::from_be_bytes(read_array(record, KEY_SIZE_OFFSET)) as usize;

    buf.extend_from_slice(&record[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + TIMESTAMP_SIZE]);
    buf.extend_from_slice(&record[KEY_SIZE_OFFSET..KEY_SIZE_OFFSET + KEY_SIZE_LEN]);
    buf.extend_from_slice(&(record.len() as u32).to_be_bytes());
    buf.extend_from_slice(&(record_offset as f64).to_be_bytes());
    buf.extend_from_slice(&record[HEADER_SIZE..HEADER_SIZE + key_size]);
    buf.len() - start
}

pub fn encode_hint(record: &[u8], record_offset: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HINT_HEADER_SIZE + record.len());
    encode_hint_into(&mut buf, record, record_offset);
    buf
}

/// Decodes the hint record at the front of `buf`.
pub fn decode_hint(buf: &[u8]) -> Result<HintEntry<'_>, FrameError> {
    if buf.len() < HINT_HEADER_SIZE {
        return Err(FrameError::Truncated {
            needed: HINT_HEADER_SIZE,
            actual: buf.len(),
        });
    }
    let timestamp = f64::from_be_bytes(read_array(buf, 0));
    let key_size = u16::from_be_bytes(read_array(buf, TIMESTAMP_SIZE));
    let total_size = u32::from_be_bytes(read_array(buf, TIMESTAMP_SIZE + KEY_SIZE_LEN));
    let record_offset = f64::from_be_bytes(read_array(
        buf,
        TIMESTAMP_SIZE + KEY_SIZE_LEN + TOTAL_SIZE_LEN,
    ));

    let minimum = HEADER_SIZE + key_size as usize;
    if (total_size as usize) < minimum {
        return Err(FrameError::BadTotalSize {
            total: total_size,
            minimum,
        });
    }

    let end = HINT_HEADER_SIZE + key_size as usize;
    if buf.len() < end {
        return Err(FrameError::Truncated {
            needed: end,
            actual: buf.len(),
        });
    }

    Ok(HintEntry {
        timestamp,
        key_size,
        total_size,
        record_offset: record_offset as u64,
        key: &buf[HINT_HEADER_SIZE..end],
    })
}

fn read_array<const N: usize>(buf: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[at..at + N]);
    out
}
