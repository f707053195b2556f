//! Reliable Ordered Delivery Component
//!
//! Sequence-space bookkeeping for both directions plus the RFC 1323
//! timestamp state.

use crate::seq::{seq_geq, seq_gt, seq_leq};

/// Reliable Ordered Delivery State
///
/// Invariant: `snd_una <= snd_nxt <= snd_max` in sequence space, and
/// `rcv_nxt` never moves backwards.
pub struct ReliableOrderedDeliveryState {
    /* Send Sequence Space */
    pub iss: u32,          // Our initial send sequence number
    pub snd_una: u32,      // Oldest unacknowledged sequence number
    pub snd_nxt: u32,      // Next sequence number to send
    pub snd_max: u32,      // Highest sequence number sent
    pub snd_up: u32,       // Send urgent pointer

    /* Receive Sequence Space */
    pub irs: u32,          // Peer's initial sequence number
    pub rcv_nxt: u32,      // Next sequence number expected
    pub rcv_adv: u32,      // Right edge of the window we advertised
    pub rcv_up: u32,       // Receive urgent pointer

    /* Send Buffer */
    /// Bytes in the send buffer (unacknowledged plus unsent).
    pub snd_cc: u32,

    /* TCP Timestamps */
    pub ts_recent: u32,
    pub ts_recent_age: u32,
    pub last_ack_sent: u32,
}

impl ReliableOrderedDeliveryState {
    pub fn new() -> Self {
        Self {
            iss: 0,
            snd_una: 0,
            snd_nxt: 0,
            snd_max: 0,
            snd_up: 0,
            irs: 0,
            rcv_nxt: 0,
            rcv_adv: 0,
            rcv_up: 0,
            snd_cc: 0,
            ts_recent: 0,
            ts_recent_age: 0,
            last_ack_sent: 0,
        }
    }

    // ------------------------------------------------------------------------
    // Connection Setup (Handshake)
    // ------------------------------------------------------------------------

    /// Start the receive sequence space from `irs` (the SYN occupies one).
    pub fn on_peer_syn(&mut self, irs: u32) {
        self.irs = irs;
        self.rcv_nxt = irs.wrapping_add(1);
        self.rcv_adv = self.rcv_nxt;
    }

    // ------------------------------------------------------------------------
    // Data Transfer
    // ------------------------------------------------------------------------

    /// Advance `rcv_nxt` over `n` accepted sequence numbers.
    #[inline]
    pub fn advance_rcv_nxt(&mut self, n: u32) {
        self.rcv_nxt = self.rcv_nxt.wrapping_add(n);
    }

    /// Record the peer's timestamp as the one to echo.
    #[inline]
    pub fn record_ts(&mut self, tsval: u32, now: u32) {
        self.ts_recent = tsval;
        self.ts_recent_age = now;
    }

    /// RFC 1323 update rule, widened to `last_ack_sent <= seq + len`
    /// so RTT measurement still works when `rcv_nxt == last_ack_sent`.
    pub fn ts_update_window(&self, seq: u32, seq_end: u32) -> bool {
        seq_leq(seq, self.last_ack_sent) && seq_leq(self.last_ack_sent, seq_end)
    }

    /// Remove `acked` bytes from the send buffer. Returns true when the ack
    /// covered more than the buffer held, i.e. our FIN was acknowledged,
    /// along with the number of data bytes actually released.
    pub fn drop_acked(&mut self, acked: u32) -> (u32, bool) {
        if acked > self.snd_cc {
            let released = self.snd_cc;
            self.snd_cc = 0;
            (released, true)
        } else {
            self.snd_cc -= acked;
            (acked, false)
        }
    }

    /// Bytes in flight.
    #[inline]
    pub fn outstanding(&self) -> u32 {
        self.snd_max.wrapping_sub(self.snd_una)
    }

    /// Pull `snd_nxt` (and `snd_max`) forward after transmitting
    /// `sent` bytes from `seq`.
    pub fn on_transmitted(&mut self, seq: u32, sent: u32) {
        let end = seq.wrapping_add(sent);
        if seq_gt(end, self.snd_nxt) {
            self.snd_nxt = end;
        }
        if seq_gt(end, self.snd_max) {
            self.snd_max = end;
        }
    }

    pub fn invariants_hold(&self) -> bool {
        seq_leq(self.snd_una, self.snd_nxt) && seq_geq(self.snd_max, self.snd_nxt)
    }
}

impl Default for ReliableOrderedDeliveryState {
    fn default() -> Self {
        Self::new()
    }
}
