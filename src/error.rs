//! Error Types
//!
//! Every recoverable failure is absorbed inside the input engine. These
//! enums exist so the absorbing code can log and count precisely, and so a
//! dying connection can report a socket error to its owner.

use thiserror::Error;

/// Wire-integrity failures found while parsing a segment.
///
/// All of them lead to a silent drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SegmentError {
    #[error("segment shorter than a TCP header ({len} bytes)")]
    Truncated { len: usize },
    #[error("data offset {offset} outside [20, {len}]")]
    BadDataOffset { offset: usize, len: usize },
    #[error("checksum mismatch")]
    BadChecksum,
}

/// Refusals from the socket receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecvBufError {
    #[error("receive side already shut down")]
    CantReceiveMore,
    #[error("no room for {needed} bytes ({available} available)")]
    NoSpace { needed: usize, available: usize },
}

/// Socket-level error reported when a connection is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnError {
    #[error("connection refused")]
    Refused,
    #[error("connection reset by peer")]
    Reset,
    #[error("connection timed out")]
    TimedOut,
}

/// Rejected configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("hz must be non-zero")]
    ZeroHz,
    #[error("retransmit floor {min} exceeds ceiling {max}")]
    RexmtRange { min: u32, max: u32 },
    #[error("blackhole mode {0} is not one of 0, 1, 2")]
    Blackhole(u8),
    #[error("log_in_vain level {0} is not one of 0, 1, 2")]
    LogInVain(u8),
    #[error("duplicate ack threshold must be at least 1")]
    RexmtThresh,
    #[error("default MSS {mss} is below {floor}")]
    DefaultMss { mss: u16, floor: u16 },
    #[error("minimum MSS {min} exceeds default MSS {default}")]
    Mss { min: u16, default: u16 },
    #[error("reassembly queue needs at least 2 slots, got {0}")]
    ReassCapacity(usize),
}
