//! RTT Estimation Component
//!
//! Jacobson/Karels smoothed RTT in fixed point, the retransmit timeout and
//! its exponential backoff.

use log::trace;

/// `srtt` carries 5 fractional bits.
pub const TCP_RTT_SHIFT: u32 = 5;
/// `rttvar` carries 4 fractional bits.
pub const TCP_RTTVAR_SHIFT: u32 = 4;
/// Fractional bits of the smoothing delta.
pub const TCP_DELTA_SHIFT: u32 = 2;

/// Retransmissions before the connection is given up.
pub const TCP_MAXRXTSHIFT: u32 = 12;

const TCP_BACKOFF: [u32; TCP_MAXRXTSHIFT as usize + 1] =
    [1, 2, 4, 8, 16, 32, 64, 64, 64, 64, 64, 64, 64];
/// SYNs back off slower at first so a lost SYN costs little.
const TCP_SYN_BACKOFF: [u32; TCP_MAXRXTSHIFT as usize + 1] =
    [1, 1, 1, 1, 1, 2, 4, 8, 16, 32, 64, 64, 64];

/// RTT Estimation State
pub struct RttState {
    /// Smoothed RTT, ticks << TCP_RTT_SHIFT. Zero until the first sample.
    pub srtt: i32,
    /// Smoothed mean deviation, ticks << TCP_RTTVAR_SHIFT.
    pub rttvar: i32,
    /// Floor of the retransmit timeout.
    pub rttmin: u32,
    /// Current retransmit timeout (ticks).
    pub rxtcur: u32,
    /// Backoff exponent, reset by every RTT sample.
    pub rxtshift: u32,
    /// Tick at which `rtseq` was sent; zero when nothing is timed.
    pub rtttime: u32,
    pub rtseq: u32,
    /// SYN retransmissions done during the handshake.
    pub rxtsyn: u32,

    /* Eifel snapshot, taken on the first retransmit timeout */
    pub srtt_prev: i32,
    pub rttvar_prev: i32,
    pub rxtcur_prev: u32,
}

impl RttState {
    pub fn new() -> Self {
        Self {
            srtt: 0,
            rttvar: 0,
            rttmin: 2,
            rxtcur: 0,
            rxtshift: 0,
            rtttime: 0,
            rtseq: 0,
            rxtsyn: 0,
            srtt_prev: 0,
            rttvar_prev: 0,
            rxtcur_prev: 0,
        }
    }

    /// Base retransmit value: srtt + 4 * rttvar, at least `rttmin`.
    pub fn rexmt_val(&self) -> u32 {
        let v = (self.srtt >> (TCP_RTT_SHIFT - TCP_DELTA_SHIFT)).saturating_add(self.rttvar)
            >> TCP_DELTA_SHIFT;
        (v.max(0) as u32).max(self.rttmin)
    }

    /// Start timing the segment starting at `seq`.
    pub fn start_timing(&mut self, now: u32, seq: u32) {
        if self.rtttime == 0 {
            self.rtttime = now;
            self.rtseq = seq;
        }
    }

    // ------------------------------------------------------------------------
    // Sampling
    // ------------------------------------------------------------------------

    /// Fold one RTT sample (in ticks, clamped to `rexmt_max`) into the
    /// estimator and recompute `rxtcur` within
    /// `[max(rttmin, rtt + 2), rexmt_max]`.
    ///
    /// With `rebase` set (first sample after a spurious timeout) the
    /// estimator restarts from the sample but never below the values saved
    /// at the timeout, and the new RTO exceeds the old one by at least
    /// `rtoinc`.
    pub fn xmit_timer(&mut self, rtt: i32, rebase: bool, rexmt_max: u32, rtoinc: u32) {
        let rtt = rtt.clamp(1, i32::try_from(rexmt_max).unwrap_or(i32::MAX).max(1));

        if rebase {
            self.srtt = self.srtt_prev.max(rtt.saturating_mul(1 << TCP_RTT_SHIFT));
            self.rttvar = self.rttvar_prev.max(rtt.saturating_mul(1 << (TCP_RTTVAR_SHIFT - 1)));
        } else if self.srtt != 0 {
            let mut delta = (rtt - 1)
                .saturating_mul(1 << TCP_DELTA_SHIFT)
                .saturating_sub(self.srtt >> (TCP_RTT_SHIFT - TCP_DELTA_SHIFT));
            self.srtt = self.srtt.saturating_add(delta);
            if self.srtt <= 0 {
                self.srtt = 1;
            }

            delta = delta.saturating_abs();
            delta -= self.rttvar >> (TCP_RTTVAR_SHIFT - TCP_DELTA_SHIFT);
            self.rttvar = self.rttvar.saturating_add(delta);
            if self.rttvar <= 0 {
                self.rttvar = 1;
            }
        } else {
            // First sample: variance of half the RTT, so the first
            // retransmit happens at 3 * rtt.
            self.srtt = rtt.saturating_mul(1 << TCP_RTT_SHIFT);
            self.rttvar = rtt.saturating_mul(1 << (TCP_RTTVAR_SHIFT - 1));
        }
        self.rtttime = 0;
        self.rxtshift = 0;

        let floor = self.rttmin.max((rtt as u32).saturating_add(2));
        self.rxtcur = range_set(self.rexmt_val(), floor, rexmt_max);

        let rebase_floor = self.rxtcur_prev.saturating_add(rtoinc);
        if rebase && self.rxtcur < rebase_floor {
            self.rxtcur = rebase_floor;
        }
        trace!(
            "rtt sample {} -> srtt {} rttvar {} rxtcur {}",
            rtt,
            self.srtt,
            self.rttvar,
            self.rxtcur
        );
    }

    // ------------------------------------------------------------------------
    // Timeout
    // ------------------------------------------------------------------------

    /// Save what the Eifel response needs; `srtt_prev` is padded by
    /// `rtoinc` so the rebased estimate cannot come out lower.
    pub fn save_for_eifel(&mut self, rtoinc: u32) {
        self.rxtcur_prev = self.rxtcur;
        self.srtt_prev = self
            .srtt
            .saturating_add((rtoinc as i32).saturating_mul(1 << TCP_RTT_SHIFT));
        self.rttvar_prev = self.rttvar;
    }

    /// Back off after a retransmit timeout. Returns false once the
    /// retransmission budget is exhausted.
    pub fn backoff(&mut self, syn: bool, rexmt_max: u32) -> bool {
        self.rxtshift += 1;
        if self.rxtshift > TCP_MAXRXTSHIFT {
            self.rxtshift = TCP_MAXRXTSHIFT;
            return false;
        }
        let table = if syn { &TCP_SYN_BACKOFF } else { &TCP_BACKOFF };
        let rexmt = self.rexmt_val().saturating_mul(table[self.rxtshift as usize]);
        self.rxtcur = range_set(rexmt, self.rttmin, rexmt_max);

        // After several backoffs the estimate is probably stale: fold srtt
        // into the variance and start over with the next sample.
        if self.rxtshift > TCP_MAXRXTSHIFT / 4 {
            self.rttvar = self.rttvar.saturating_add(self.srtt >> TCP_RTT_SHIFT);
            self.srtt = 0;
        }
        self.rtttime = 0;
        true
    }
}

impl Default for RttState {
    fn default() -> Self {
        Self::new()
    }
}

/// Clamp `value` into `[min, max]`.
#[inline]
pub fn range_set(value: u32, min: u32, max: u32) -> u32 {
    value.max(min).min(max)
}
