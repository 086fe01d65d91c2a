//! Canopy Protocol -- wire packets and the incremental codec.
//!
//! TCP between tree neighbours. Binary framing: one tag byte per packet
//! kind, big-endian integer fields, strings as i32 byte-length + UTF-8.

pub mod codec;
pub mod packets;

pub use codec::PacketCodec;
pub use packets::{DiscJob, Packet};

/// Upper bound for a single length-prefixed string on the wire (64 KiB).
pub const MAX_STRING_LEN: usize = 64 * 1024;

/// Upper bound for the job list carried by a DISC packet.
pub const MAX_DISC_JOBS: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown packet tag: {0:#04x}")]
    UnknownTag(u8),
    #[error("negative length field: {0}")]
    NegativeLength(i32),
    #[error("string too long: {len} bytes (max {max})")]
    StringTooLong { len: usize, max: usize },
    #[error("disc job list too long: {len} entries (max {max})")]
    JobListTooLong { len: usize, max: usize },
    #[error("malformed range: start {start} > end {end}")]
    MalformedRange { start: i64, end: i64 },
    #[error("negative potential: {0}")]
    NegativePotential(i32),
    #[error("negative job id: {0}")]
    NegativeJobId(i64),
    #[error("invalid utf-8 in string field")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
