//! External Collaborators
//!
//! The input engine does not own connection lookup, segment transmission,
//! timers, the SACK scoreboard or socket buffers. It reaches them through
//! the traits below, injected as trait objects by whoever embeds the engine.

use std::sync::Arc;

use spin::Mutex;

use crate::error::{ConnError, RecvBufError};
use crate::options::SackBlock;
use crate::state::TcpConnectionState;
use crate::tcp_out::ResetSegment;
use crate::tcp_types::{ConnId, FourTuple};

// ============================================================================
// Connection lookup
// ============================================================================

/// Result of a 4-tuple lookup.
pub enum Lookup<'a> {
    Connection(&'a mut TcpConnectionState),
    /// No connection, but a listener accepts new connections on the port.
    Listener,
    NotFound,
}

/// Demultiplexing table owned by the embedding stack.
pub trait ConnectionTable {
    fn lookup(&mut self, tuple: &FourTuple) -> Lookup<'_>;

    /// The engine closed `id`; the table should release it.
    fn detach(&mut self, id: ConnId);
}

// ============================================================================
// Socket receive buffer
// ============================================================================

/// Application-facing receive buffer of one socket.
pub trait SocketRecvBuffer {
    /// Queue in-order bytes for the application.
    fn append(&mut self, data: Vec<u8>) -> Result<(), RecvBufError>;
    fn space_available(&self) -> usize;
    /// No more data will arrive (FIN received or connection dropped).
    fn mark_cant_receive_more(&mut self);
    fn cant_receive_more(&self) -> bool;

    /// High-water mark (buffer limit).
    fn hiwat(&self) -> usize;
    /// Try to grow the limit to `size`; false if the socket refused.
    fn reserve(&mut self, size: usize) -> bool;
    /// Whether the buffer may be grown automatically.
    fn autosize(&self) -> bool;
    fn set_autosize(&mut self, on: bool);

    /// Record a socket error for the application to collect.
    fn set_error(&mut self, err: ConnError);
}

/// Shared handle to a socket receive buffer.
///
/// The buffer is the only state the engine shares with other threads, so
/// the lock is taken per call and never held across engine logic.
#[derive(Clone)]
pub struct RecvBufHandle(Arc<Mutex<Box<dyn SocketRecvBuffer + Send>>>);

impl RecvBufHandle {
    pub fn new(buf: impl SocketRecvBuffer + Send + 'static) -> Self {
        Self(Arc::new(Mutex::new(Box::new(buf))))
    }

    pub fn append(&self, data: Vec<u8>) -> Result<(), RecvBufError> {
        self.0.lock().append(data)
    }

    pub fn space_available(&self) -> usize {
        self.0.lock().space_available()
    }

    pub fn mark_cant_receive_more(&self) {
        self.0.lock().mark_cant_receive_more()
    }

    pub fn cant_receive_more(&self) -> bool {
        self.0.lock().cant_receive_more()
    }

    pub fn hiwat(&self) -> usize {
        self.0.lock().hiwat()
    }

    pub fn reserve(&self, size: usize) -> bool {
        self.0.lock().reserve(size)
    }

    pub fn autosize(&self) -> bool {
        self.0.lock().autosize()
    }

    pub fn set_autosize(&self, on: bool) {
        self.0.lock().set_autosize(on)
    }

    pub fn set_error(&self, err: ConnError) {
        self.0.lock().set_error(err)
    }
}

// ============================================================================
// Output scheduler
// ============================================================================

/// Outbound segment construction, owned by the output path.
pub trait OutputScheduler {
    /// Send a pure ACK for `conn` right away.
    fn request_ack_now(&mut self, conn: ConnId);
    /// Run the regular output routine for `conn` (data, window updates).
    fn request_output(&mut self, conn: ConnId);
    /// Forget any output queued for `conn` (connection is going away).
    fn cancel_pending_output(&mut self, conn: ConnId);
    /// Transmit up to `len` bytes of the send stream starting at `seq`,
    /// ignoring the congestion window. Returns the bytes sent, which may
    /// be fewer when the send buffer or the peer's window runs out.
    fn transmit(&mut self, conn: ConnId, seq: u32, len: u32) -> u32;
    fn send_reset(&mut self, rst: &ResetSegment);
}

// ============================================================================
// Timers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    Rexmt,
    Persist,
    Keep,
    TwoMsl,
    Delack,
}

impl TimerId {
    pub const ALL: [TimerId; 5] =
        [TimerId::Rexmt, TimerId::Persist, TimerId::Keep, TimerId::TwoMsl, TimerId::Delack];
}

/// Per-connection one-shot timers. Firing re-enters the engine through
/// the handlers in `timers`.
pub trait TimerService {
    /// (Re)arm `timer` to fire `ticks` from now.
    fn arm(&mut self, conn: ConnId, timer: TimerId, ticks: u32);
    fn disarm(&mut self, conn: ConnId, timer: TimerId);
    fn is_armed(&self, conn: ConnId, timer: TimerId) -> bool;
}

// ============================================================================
// SACK scoreboard
// ============================================================================

/// Send-side positions the scoreboard needs to plan retransmissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SackCursor {
    pub snd_una: u32,
    pub snd_max: u32,
    /// Highest sequence retransmitted in this recovery episode.
    pub rexmt_high: u32,
    /// Where the rescue retransmission went, if one was sent.
    pub rexmt_rescue: u32,
    pub rescued: bool,
    pub maxseg: u32,
}

/// Next thing to (re)transmit during SACK recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RexmtCandidate {
    pub seq: u32,
    pub len: u32,
    /// RFC 6675 rescue retransmission.
    pub rescue: bool,
}

/// Record of what the peer has selectively acknowledged.
pub trait SackScoreboard {
    /// Record one reported block. Returns true when it told us something
    /// we did not know.
    fn record_block(&mut self, block: SackBlock, snd_una: u32, snd_max: u32) -> bool;
    /// Discard everything below the new cumulative ack.
    fn advance(&mut self, snd_una: u32);
    /// RFC 6675 IsLost().
    fn is_lost(&self, seq: u32) -> bool;
    /// Bytes from `snd_una` to the first SACKed block (the first hole).
    fn first_unsacked_len(&self, snd_una: u32, snd_max: u32) -> u32;
    /// RFC 6675 pipe: bytes believed to be in flight.
    fn compute_pipe(&self, cursor: &SackCursor) -> u32;
    /// At least `amount` bytes are SACKed.
    fn has_sacked(&self, amount: u32) -> bool;
    /// RFC 6675 NextSeg().
    fn next_segment(&self, cursor: &SackCursor) -> Option<RexmtCandidate>;
    /// Recompute the lost boundary for a new duplicate threshold.
    fn update_lost_seq(&mut self, snd_una: u32, maxseg: u32, rxtthresh: u32);
    /// Snapshot before a retransmit timeout wipes the board.
    fn save(&mut self);
    /// Restore the snapshot after a spurious timeout.
    fn revert(&mut self, snd_una: u32);
    fn clear(&mut self);
    fn is_empty(&self) -> bool;
}
