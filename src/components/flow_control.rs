//! Flow Control Component
//!
//! Manages the peer's send window, our receive window and the automatic
//! receive-buffer sizing estimator.

use crate::seq::{seq_diff, seq_lt, tstmp_gt};
use crate::tcp_proto::TCP_MAXWIN;

/// Flow Control State
pub struct FlowControlState {
    /* Peer's Receive Window */
    pub snd_wnd: u32,          // Window the peer advertised (unscaled)
    pub max_sndwnd: u32,       // Largest window the peer advertised
    pub snd_wl1: u32,          // Segment seq of the last window update
    pub snd_wl2: u32,          // Segment ack of the last window update

    /* Our Receive Window */
    pub rcv_wnd: u32,

    /* Window Scaling */
    pub snd_scale: u8,         // Shift applied to the peer's advertisements
    pub rcv_scale: u8,         // Shift applied to our advertisements
    pub request_r_scale: u8,   // Shift we offered on our SYN
    pub requested_s_scale: u8, // Shift the peer offered on its SYN

    /* Receive Buffer Auto-sizing */
    pub rfbuf_ts: u32,         // Timestamp opening the measurement round
    pub rfbuf_cnt: usize,      // Bytes received in the round
}

impl FlowControlState {
    pub fn new() -> Self {
        Self {
            snd_wnd: 0,
            max_sndwnd: 0,
            snd_wl1: 0,
            snd_wl2: 0,
            rcv_wnd: 0,
            snd_scale: 0,
            rcv_scale: 0,
            request_r_scale: 0,
            requested_s_scale: 0,
            rfbuf_ts: 0,
            rfbuf_cnt: 0,
        }
    }

    /// The window field of a segment in bytes. Windows on SYNs are never
    /// scaled.
    pub fn unscale(&self, wnd: u16, is_syn: bool) -> u32 {
        if is_syn {
            u32::from(wnd)
        } else {
            u32::from(wnd) << self.snd_scale
        }
    }

    /// Both ends agreed to scale: start applying the shifts.
    pub fn apply_scaling(&mut self) {
        self.snd_scale = self.requested_s_scale;
        self.rcv_scale = self.request_r_scale;
    }

    /// Largest congestion window this connection can use.
    pub fn max_cwnd(&self) -> u32 {
        TCP_MAXWIN << self.snd_scale
    }

    // ------------------------------------------------------------------------
    // Send window
    // ------------------------------------------------------------------------

    /// RFC 793 window update test: newer segment, or same segment with a
    /// newer ack, or same ack with a larger window.
    pub fn acceptable_window_update(&self, seq: u32, ack: u32, tiwin: u32) -> bool {
        seq_lt(self.snd_wl1, seq)
            || (self.snd_wl1 == seq
                && (seq_lt(self.snd_wl2, ack) || (self.snd_wl2 == ack && tiwin > self.snd_wnd)))
    }

    /// Take the window from a segment that passed the update test. Returns
    /// true when this was a pure window update (no data, same ack, larger
    /// window).
    pub fn apply_window_update(&mut self, seq: u32, ack: u32, tiwin: u32, pure: bool) -> bool {
        let winupd = pure && self.snd_wl2 == ack && tiwin > self.snd_wnd;
        self.snd_wnd = tiwin;
        self.snd_wl1 = seq;
        self.snd_wl2 = ack;
        if self.snd_wnd > self.max_sndwnd {
            self.max_sndwnd = self.snd_wnd;
        }
        winupd
    }

    // ------------------------------------------------------------------------
    // Receive window
    // ------------------------------------------------------------------------

    /// Receive window for this segment: buffer space, but never less than
    /// what we already advertised.
    pub fn compute_rcv_wnd(&mut self, space: usize, rcv_adv: u32, rcv_nxt: u32) -> u32 {
        let space = u32::try_from(space).unwrap_or(u32::MAX);
        let advertised = seq_diff(rcv_adv, rcv_nxt).max(0) as u32;
        self.rcv_wnd = space.max(advertised);
        self.rcv_wnd
    }

    /// Leave bulk-receive mode; the next round starts from scratch.
    pub fn reset_autorcvbuf(&mut self) {
        self.rfbuf_ts = 0;
        self.rfbuf_cnt = 0;
    }

    /// One step of receive buffer auto-sizing for `tlen` in-order bytes
    /// echoing `tsecr`. A round lasts one RTT (until the echo catches up
    /// with the timestamp that opened it, within a second). If the round
    /// filled more than 7/8 of the buffer, returns the grown size.
    pub fn autorcvbuf_step(
        &mut self,
        tsecr: u32,
        tlen: usize,
        hz: u32,
        hiwat: usize,
        inc: usize,
        max: usize,
    ) -> Option<usize> {
        let mut newsize = None;
        if tstmp_gt(tsecr, self.rfbuf_ts) && tsecr.wrapping_sub(self.rfbuf_ts) < hz {
            if self.rfbuf_cnt > hiwat / 8 * 7 && hiwat < max {
                newsize = Some((hiwat + inc).min(max));
            }
            self.reset_autorcvbuf();
        } else {
            self.rfbuf_cnt += tlen;
        }
        newsize
    }
}

impl Default for FlowControlState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn fc(wl1: u32, wl2: u32, wnd: u32) -> FlowControlState {
        let mut fc = FlowControlState::new();
        fc.snd_wl1 = wl1;
        fc.snd_wl2 = wl2;
        fc.snd_wnd = wnd;
        fc
    }

    #[test_case(101, 50, 1000 => true; "newer segment")]
    #[test_case(99, 50, 1000 => false; "older segment")]
    #[test_case(100, 51, 1000 => true; "same seq newer ack")]
    #[test_case(100, 49, 4000 => false; "same seq older ack")]
    #[test_case(100, 50, 2000 => true; "same seq same ack larger window")]
    #[test_case(100, 50, 500 => false; "same seq same ack smaller window")]
    fn test_acceptable_window_update(seq: u32, ack: u32, wnd: u32) -> bool {
        fc(100, 50, 1000).acceptable_window_update(seq, ack, wnd)
    }

    #[test]
    fn test_apply_window_update_tracks_max() {
        let mut f = fc(100, 50, 1000);
        assert!(f.apply_window_update(100, 50, 3000, true));
        assert_eq!((f.snd_wnd, f.max_sndwnd), (3000, 3000));
        assert!(!f.apply_window_update(200, 60, 500, false));
        assert_eq!((f.snd_wnd, f.max_sndwnd, f.snd_wl1, f.snd_wl2), (500, 3000, 200, 60));
    }

    #[test]
    fn test_unscale_skips_syn() {
        let mut f = FlowControlState::new();
        f.snd_scale = 3;
        assert_eq!(f.unscale(100, false), 800);
        assert_eq!(f.unscale(100, true), 100);
        assert_eq!(f.max_cwnd(), 65535 << 3);
    }

    #[test]
    fn test_rcv_wnd_never_shrinks_below_advertised() {
        let mut f = FlowControlState::new();
        assert_eq!(f.compute_rcv_wnd(100, 5000, 1000), 4000);
        assert_eq!(f.compute_rcv_wnd(8000, 5000, 1000), 8000);
        // rcv_adv behind rcv_nxt counts as zero.
        assert_eq!(f.compute_rcv_wnd(0, 900, 1000), 0);
    }

    #[test]
    fn test_autorcvbuf_grows_after_full_round() {
        let mut f = FlowControlState::new();
        f.rfbuf_ts = 10;
        // Echo has not caught up yet: accumulate.
        assert_eq!(f.autorcvbuf_step(10, 60_000, 1000, 65536, 16384, 1 << 20), None);
        assert_eq!(f.rfbuf_cnt, 60_000);
        // Round closes, 60000 > 7/8 of 65536.
        assert_eq!(f.autorcvbuf_step(50, 1000, 1000, 65536, 16384, 1 << 20), Some(81920));
        assert_eq!((f.rfbuf_ts, f.rfbuf_cnt), (0, 0));
    }
}
