//! Typed views over raw DAQ buffers.
//!
//! Every buffer a module emits — hit, monitoring, supernova or time
//! calibration — carries the same 32-byte header. The merge engine only needs
//! the channel id and the timestamp out of it; everything past the header is
//! opaque payload that is forwarded untouched.
//!
//! All header fields are big-endian. The timestamp is a signed 64-bit count
//! of 0.1-ns units since the run-local epoch and is monotone nondecreasing
//! per channel; `i64::MAX` in the timestamp slot marks end-of-stream.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Header layout
//
//   Bytes  0 ..  3 = record length (u32 BE)
//   Bytes  4 ..  7 = format / kind tag (u32 BE)
//   Bytes  8 .. 15 = channel id, the module mainboard id (u64 BE)
//   Bytes 16 .. 23 = reserved
//   Bytes 24 .. 31 = timestamp (i64 BE, 0.1 ns since run-local epoch)
// ---------------------------------------------------------------------------

pub const HEADER_LEN: usize = 32;

const LEN_OFF: usize = 0;
const FMT_OFF: usize = 4;
const MBID_OFF: usize = 8;
const TIMESTAMP_OFF: usize = 24;

/// Timestamp value that marks end-of-stream for a channel.
pub const EOS_TIMESTAMP: i64 = i64::MAX;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("buffer too short for DAQ header: {len} bytes, need {HEADER_LEN}")]
    Malformed { len: usize },
}

/// Read-only projection of a raw buffer: `(mbid, timestamp, bytes)`.
///
/// Owns the underlying bytes; `mbid` and `timestamp` are parsed once at
/// construction so the merge comparator never re-reads the header.
#[derive(Debug, Clone)]
pub struct DaqBuffer {
    mbid: u64,
    timestamp: i64,
    bytes: Vec<u8>,
}

impl DaqBuffer {
    pub fn parse(bytes: Vec<u8>) -> Result<Self, BufferError> {
        if bytes.len() < HEADER_LEN {
            return Err(BufferError::Malformed { len: bytes.len() });
        }
        let mbid = u64::from_be_bytes(bytes[MBID_OFF..MBID_OFF + 8].try_into().unwrap());
        let timestamp =
            i64::from_be_bytes(bytes[TIMESTAMP_OFF..TIMESTAMP_OFF + 8].try_into().unwrap());
        Ok(Self { mbid, timestamp, bytes })
    }

    pub fn mbid(&self) -> u64 {
        self.mbid
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn format_tag(&self) -> u32 {
        u32::from_be_bytes(self.bytes[FMT_OFF..FMT_OFF + 4].try_into().unwrap())
    }

    pub fn is_eos(&self) -> bool {
        self.timestamp == EOS_TIMESTAMP
    }

    /// Bytes past the 32-byte header.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_LEN..]
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Merge order: `(timestamp, mbid)`, both ascending. The mbid tie-break
    /// makes output order deterministic when two channels stamp identically.
    pub fn sort_key(&self) -> (i64, u64) {
        (self.timestamp, self.mbid)
    }
}

/// Build a raw buffer with the standard 32-byte header around `payload`.
pub fn build_raw(mbid: u64, format_tag: u32, timestamp: i64, payload: &[u8]) -> Vec<u8> {
    let len = HEADER_LEN + payload.len();
    let mut buf = Vec::with_capacity(len);
    buf.extend_from_slice(&(len as u32).to_be_bytes());
    buf.extend_from_slice(&format_tag.to_be_bytes());
    buf.extend_from_slice(&mbid.to_be_bytes());
    buf.extend_from_slice(&0u64.to_be_bytes());
    buf.extend_from_slice(&timestamp.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Build the 32-byte end-of-stream sentinel for `mbid`:
/// length 32, format 0, reserved 0, timestamp `i64::MAX`.
pub fn eos_sentinel(mbid: u64) -> Vec<u8> {
    build_raw(mbid, 0, EOS_TIMESTAMP, &[])
}
