//! Congestion Control Component
//!
//! Manages the congestion window, slow start threshold, fast recovery and
//! the snapshot used to undo a spurious retransmission.

use bitflags::bitflags;

use crate::seq::{seq_gt, seq_lt};
use crate::tcp_proto::{TCP_MAXWIN, TCP_MAX_WINSHIFT};

bitflags! {
    /// Retransmission bookkeeping flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RxtFlags: u32 {
        /// Recompute the RTO from the next sample (Eifel response).
        const REBASERTO = 0x0001;
        /// Fast recovery was active when the snapshot was taken.
        const WASFRECOVERY = 0x0002;
        /// Waiting for the first acceptable ack after a retransmission.
        const FIRSTACCACK = 0x0004;
        const FASTREXMT = 0x0008;
        const EARLYREXMT = 0x0010;
        /// In fast recovery.
        const FASTRECOVERY = 0x0020;
    }
}

/// RFC 3390 initial window for `mss`.
pub fn initial_window(mss: u32) -> u32 {
    (4 * mss).min((2 * mss).max(4380))
}

/// Congestion Control State
///
/// Only the ack engine, the recovery logic and the retransmit timer write
/// to this state.
pub struct CongestionControlState {
    pub cwnd: u32,             // Congestion Window
    pub ssthresh: u32,         // Slow Start Threshold
    pub recover: u32,          // snd_max when recovery started
    pub dupacks: u32,          // Consecutive duplicate acks
    pub rxtthresh: u32,        // Duplicate acks that trigger fast retransmit
    /// Bytes acked toward the next congestion-avoidance increment.
    pub wacked: u32,
    /// Segments sent by limited transmit in this dup-ack run.
    pub snd_limited: u32,

    /* SACK recovery */
    pub rexmt_high: u32,       // Highest sequence retransmitted
    pub rexmt_rescue: u32,     // End of the rescue retransmission

    pub flags: RxtFlags,

    /* Snapshot for undoing a spurious retransmission */
    pub cwnd_prev: u32,
    pub wacked_prev: u32,
    pub ssthresh_prev: u32,
    pub recover_prev: u32,
    pub snd_max_prev: u32,
    /// Tick of the retransmission, compared against echoed timestamps.
    pub rexmt_ts: u32,
    /// Acks before this tick make the first RTO look spurious.
    pub badrxtwin: u32,
}

impl CongestionControlState {
    pub fn new() -> Self {
        Self {
            cwnd: 0,
            ssthresh: TCP_MAXWIN << TCP_MAX_WINSHIFT,   // Initial ssthresh is large
            recover: 0,
            dupacks: 0,
            rxtthresh: 3,
            wacked: 0,
            snd_limited: 0,
            rexmt_high: 0,
            rexmt_rescue: 0,
            flags: RxtFlags::empty(),
            cwnd_prev: 0,
            wacked_prev: 0,
            ssthresh_prev: 0,
            recover_prev: 0,
            snd_max_prev: 0,
            rexmt_ts: 0,
            badrxtwin: 0,
        }
    }

    // ------------------------------------------------------------------------
    // Fast Recovery
    // ------------------------------------------------------------------------

    #[inline]
    pub fn in_fast_recovery(&self) -> bool {
        self.flags.contains(RxtFlags::FASTRECOVERY)
    }

    pub fn enter_fast_recovery(&mut self, snd_max: u32) {
        self.flags.insert(RxtFlags::FASTRECOVERY);
        self.recover = snd_max;
    }

    pub fn exit_fast_recovery(&mut self) {
        self.flags.remove(RxtFlags::FASTRECOVERY);
    }

    /// Halve the flight into `ssthresh` on a loss: half of
    /// `min(snd_wnd, cwnd)`, rounded down to segments, never below two.
    pub fn halve_ssthresh(&mut self, snd_wnd: u32, maxseg: u32) {
        let maxseg = maxseg.max(1);
        let win = (snd_wnd.min(self.cwnd) / 2 / maxseg).max(2);
        self.ssthresh = win * maxseg;
    }

    /// The ack reached `recover`: leave recovery. Without SACK the window
    /// deflates to `ssthresh`; either way it is capped so no more than two
    /// segments can burst out.
    pub fn exit_recovery_on_ack(
        &mut self,
        ack: u32,
        snd_una: u32,
        snd_max: u32,
        maxseg: u32,
        sack: bool,
    ) {
        self.exit_fast_recovery();
        if !sack {
            self.cwnd = self.ssthresh;
        }
        let limit = snd_max.wrapping_add(2 * maxseg);
        if seq_gt(ack.wrapping_add(self.cwnd), limit) {
            self.cwnd = snd_max.wrapping_sub(snd_una) + 2 * maxseg;
        }
        self.wacked = 0;
    }

    /// NewReno partial-ack deflation: take back what was acked, then add
    /// one segment for the retransmission that just went out.
    pub fn deflate_partial(&mut self, ocwnd: u32, acked: u32, maxseg: u32) {
        self.cwnd = if ocwnd > acked { ocwnd - acked + maxseg } else { maxseg };
    }

    // ------------------------------------------------------------------------
    // Window growth
    // ------------------------------------------------------------------------

    /// Grow `cwnd` for `acked` new bytes outside recovery.
    ///
    /// Slow start adds `acked` when byte counting is on, capped at two
    /// segments, or one while retransmitting (RFC 3465). Without byte
    /// counting it adds one segment per ack. Congestion
    /// avoidance adds one segment per window's worth of acked bytes. The
    /// result never exceeds `max_cwnd`.
    pub fn grow(&mut self, acked: u32, maxseg: u32, abc: bool, retransmitting: bool, max_cwnd: u32) {
        if self.cwnd <= self.ssthresh {
            let incr = if abc {
                let limit = if retransmitting { maxseg } else { 2 * maxseg };
                acked.min(limit)
            } else {
                maxseg
            };
            self.cwnd = self.cwnd.saturating_add(incr);
        } else {
            self.wacked = self.wacked.saturating_add(if abc { acked } else { maxseg });
            if self.wacked >= self.cwnd {
                self.wacked -= self.cwnd;
                self.cwnd = self.cwnd.saturating_add(maxseg);
            }
        }
        self.cwnd = self.cwnd.min(max_cwnd);
    }

    /// An ack for data never sent: assume an optimistic-ack attack.
    pub fn collapse(&mut self, maxseg: u32) {
        self.cwnd = maxseg;
        self.wacked = 0;
    }

    /// Retransmit timeout: back to one segment, out of recovery.
    pub fn on_timeout(&mut self, snd_wnd: u32, maxseg: u32) {
        self.halve_ssthresh(snd_wnd, maxseg);
        self.cwnd = maxseg;
        self.wacked = 0;
        self.dupacks = 0;
        self.exit_fast_recovery();
    }

    /// The first acceptable ack arrived; stop looking for it.
    pub fn clear_rxt_flags(&mut self) {
        self.flags
            .remove(RxtFlags::FIRSTACCACK | RxtFlags::FASTREXMT | RxtFlags::EARLYREXMT);
    }

    // ------------------------------------------------------------------------
    // Spurious retransmission undo
    // ------------------------------------------------------------------------

    /// Snapshot before a retransmission. With timestamps the retransmit
    /// tick is recorded so the first acceptable ack can tell whether it
    /// acknowledges the original or the retransmission.
    pub fn save(&mut self, snd_max: u32, now: u32, timestamps: bool) {
        self.cwnd_prev = self.cwnd;
        self.wacked_prev = self.wacked;
        self.ssthresh_prev = self.ssthresh;
        self.recover_prev = self.recover;
        self.snd_max_prev = snd_max;
        self.flags.set(RxtFlags::WASFRECOVERY, self.in_fast_recovery());
        if timestamps {
            self.rexmt_ts = now;
            self.flags.insert(RxtFlags::FIRSTACCACK);
        }
    }

    /// Restore the snapshot. Unless the retransmission was a fast
    /// retransmit, the RTO is rebased from the next sample when
    /// `eifel_response` is set.
    pub fn revert(&mut self, eifel_response: bool) {
        self.cwnd = self.cwnd_prev;
        self.wacked = self.wacked_prev;
        self.ssthresh = self.ssthresh_prev;
        self.recover = self.recover_prev;
        if self.flags.contains(RxtFlags::WASFRECOVERY) {
            self.flags.insert(RxtFlags::FASTRECOVERY);
        }
        if !self.flags.contains(RxtFlags::FASTREXMT) && eifel_response {
            self.flags.insert(RxtFlags::REBASERTO);
        }
        self.badrxtwin = 0;
    }

    /// The ack covers the data outstanding when the snapshot was taken, so
    /// a pending RTO rebase may be applied.
    pub fn take_rebase(&mut self, ack: u32) -> bool {
        if self.flags.contains(RxtFlags::REBASERTO) && seq_gt(ack, self.snd_max_prev) {
            self.flags.remove(RxtFlags::REBASERTO);
            true
        } else {
            false
        }
    }

    /// The ack lies below `recover`: the dup-ack run belongs to a loss
    /// already handled.
    pub fn below_recover(&self, ack: u32) -> bool {
        seq_lt(ack, self.recover)
    }
}

impl Default for CongestionControlState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(536 => 2144; "small mss gets four segments")]
    #[test_case(1460 => 4380; "ethernet mss capped at 4380")]
    #[test_case(4000 => 8000; "jumbo mss gets two segments")]
    fn test_initial_window(mss: u32) -> u32 {
        initial_window(mss)
    }

    #[test]
    fn test_slow_start_abc() {
        let mut cc = CongestionControlState::new();
        cc.cwnd = 2000;
        cc.grow(1000, 1000, true, false, 65535);
        assert_eq!(cc.cwnd, 3000);
        cc.grow(5000, 1000, true, false, 65535);
        assert_eq!(cc.cwnd, 5000);
        // While retransmitting, one segment per ack.
        cc.grow(5000, 1000, true, true, 65535);
        assert_eq!(cc.cwnd, 6000);
    }

    #[test]
    fn test_congestion_avoidance_accumulates() {
        let mut cc = CongestionControlState::new();
        cc.cwnd = 4000;
        cc.ssthresh = 3000;
        cc.grow(2000, 1000, true, false, 65535);
        assert_eq!((cc.cwnd, cc.wacked), (4000, 2000));
        cc.grow(2500, 1000, true, false, 65535);
        assert_eq!((cc.cwnd, cc.wacked), (5000, 500));
    }

    #[test]
    fn test_growth_is_clamped() {
        let mut cc = CongestionControlState::new();
        cc.cwnd = 65000;
        cc.grow(1000, 1000, true, false, 65535);
        assert_eq!(cc.cwnd, 65535);
    }

    #[test]
    fn test_halve_ssthresh_floor() {
        let mut cc = CongestionControlState::new();
        cc.cwnd = 10_000;
        cc.halve_ssthresh(8000, 1000);
        assert_eq!(cc.ssthresh, 4000);
        cc.cwnd = 1000;
        cc.halve_ssthresh(8000, 1000);
        assert_eq!(cc.ssthresh, 2000);
    }

    #[test]
    fn test_exit_recovery_newreno() {
        let mut cc = CongestionControlState::new();
        cc.enter_fast_recovery(10_000);
        cc.ssthresh = 4000;
        cc.cwnd = 9000;
        cc.exit_recovery_on_ack(10_000, 10_000, 10_000, 1000, false);
        assert!(!cc.in_fast_recovery());
        assert_eq!(cc.cwnd, 2000);
    }

    #[test]
    fn test_save_and_revert() {
        let mut cc = CongestionControlState::new();
        cc.cwnd = 8000;
        cc.ssthresh = 16_000;
        cc.recover = 500;
        cc.save(9000, 77, true);
        assert!(cc.flags.contains(RxtFlags::FIRSTACCACK));
        assert_eq!(cc.rexmt_ts, 77);

        cc.on_timeout(10_000, 1000);
        assert_eq!((cc.cwnd, cc.ssthresh), (1000, 4000));

        cc.revert(true);
        assert_eq!((cc.cwnd, cc.ssthresh, cc.recover), (8000, 16_000, 500));
        assert!(cc.flags.contains(RxtFlags::REBASERTO));
        assert!(!cc.take_rebase(9000));
        assert!(cc.take_rebase(9001));
        assert!(!cc.flags.contains(RxtFlags::REBASERTO));
    }

    #[test]
    fn test_revert_after_fast_retransmit_restores_recovery() {
        let mut cc = CongestionControlState::new();
        cc.enter_fast_recovery(100);
        cc.save(100, 1, true);
        cc.flags.insert(RxtFlags::FASTREXMT);
        cc.exit_fast_recovery();
        cc.revert(true);
        assert!(cc.in_fast_recovery());
        assert!(!cc.flags.contains(RxtFlags::REBASERTO));
    }
}
