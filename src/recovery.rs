//! Loss Recovery
//!
//! Duplicate-ack handling and the retransmissions it drives: fast
//! retransmit and fast recovery (NewReno or SACK based), limited transmit,
//! early retransmit, and the SACK retransmission loop with its rescue
//! retransmission.

use log::debug;

use crate::options::{OptFlags, TcpOptions};
use crate::seq::{seq_lt, seq_min};
use crate::services::{SackCursor, TimerId};
use crate::state::{ConnFlags, RxtFlags, SackFlags, TcpConnectionState};
use crate::stats::TcpStat;
use crate::tcp_out::TcpTx;
use crate::worker::WorkerContext;

#[inline]
fn howmany(x: u32, y: u32) -> u32 {
    x.div_ceil(y.max(1))
}

/// The scoreboard's view of the send side.
pub fn sack_cursor(tp: &TcpConnectionState) -> SackCursor {
    SackCursor {
        snd_una: tp.rod.snd_una,
        snd_max: tp.rod.snd_max,
        rexmt_high: tp.cong_ctrl.rexmt_high,
        rexmt_rescue: tp.cong_ctrl.rexmt_rescue,
        rescued: tp.reass.sack_flags.contains(SackFlags::SACKRESCUED),
        maxseg: tp.maxseg(),
    }
}

/// Loss Recovery
pub struct Recovery;

impl Recovery {
    /// Account one duplicate ack for `ack`. Returns true when the ack was
    /// fully handled here and the segment can be dropped; false when
    /// processing should continue (the dup-ack run was reset).
    pub fn recv_dupack(
        tp: &mut TcpConnectionState,
        ctx: &mut WorkerContext,
        ack: u32,
        opts: &TcpOptions,
    ) -> bool {
        ctx.stats.inc(TcpStat::RcvDupAck);
        let maxseg = tp.maxseg();

        if tp.in_fast_recovery() {
            if tp.do_sack() {
                let only_new_sack = (opts.flags & (OptFlags::SACK | OptFlags::SACK_REDUNDANT))
                    == OptFlags::SACK;
                let force = tp.rod.snd_una == tp.cong_ctrl.rexmt_high && only_new_sack;
                Self::sack_rexmt(tp, ctx, force);
            } else {
                // Window inflation: every dup ack is a segment that left.
                tp.cong_ctrl.cwnd = tp.cong_ctrl.cwnd.saturating_add(maxseg);
                ctx.output.request_output(tp.id);
            }
            return true;
        }

        if tp.cong_ctrl.below_recover(ack) {
            // Dup acks for a loss we already recovered from.
            tp.cong_ctrl.dupacks = 0;
            return false;
        }

        if ctx.config.ignore_redundant_dsack
            && tp.do_sack()
            && opts.has(OptFlags::DSACK | OptFlags::SACK_REDUNDANT)
        {
            // Only a D-SACK plus what we already knew: likely reordering.
            return true;
        }

        tp.cong_ctrl.dupacks += 1;
        let dupacks = tp.cong_ctrl.dupacks;
        if dupacks == tp.cong_ctrl.rxtthresh {
            Self::fast_retransmit(tp, ctx, ack, true);
        } else if ctx.config.rfc6675 && tp.do_sack() {
            if ctx.config.rfc6675_rxt && tp.scoreboard.is_lost(tp.rod.snd_una) {
                Self::fast_retransmit(tp, ctx, ack, true);
            } else if ctx.config.limited_transmit && !Self::sack_limitedxmit(tp, ctx) {
                if Self::need_early_retransmit(tp, ctx, dupacks) {
                    Self::early_retransmit(tp, ctx, ack);
                } else if tp.scoreboard.is_lost(tp.rod.snd_una) {
                    Self::fast_retransmit(tp, ctx, ack, false);
                }
            }
        } else if ctx.config.limited_transmit {
            Self::limited_transmit(tp, ctx, ack, dupacks);
        }
        true
    }

    /// RFC 3042: each of the first duplicate acks lets one new segment out
    /// beyond `snd_max`.
    fn limited_transmit(tp: &mut TcpConnectionState, ctx: &mut WorkerContext, ack: u32, dupacks: u32) {
        let maxseg = tp.maxseg();
        if dupacks == 1 {
            tp.cong_ctrl.snd_limited = 0;
        }
        let (old_nxt, old_max) = (tp.rod.snd_nxt, tp.rod.snd_max);
        let len = dupacks.saturating_sub(tp.cong_ctrl.snd_limited) * maxseg;
        let sent = TcpTx::transmit(tp, ctx, old_max, len);
        if seq_lt(old_nxt, old_max) {
            tp.rod.snd_nxt = old_nxt;
        }

        if sent > maxseg {
            tp.cong_ctrl.snd_limited = 2;
            ctx.stats.add(TcpStat::SndLimited, 2);
        } else if sent > 0 {
            tp.cong_ctrl.snd_limited += 1;
            ctx.stats.inc(TcpStat::SndLimited);
        } else if Self::need_early_retransmit(tp, ctx, dupacks) {
            Self::early_retransmit(tp, ctx, ack);
        }
    }

    fn early_retransmit(tp: &mut TcpConnectionState, ctx: &mut WorkerContext, ack: u32) {
        ctx.stats.inc(TcpStat::SndEarlyRexmt);
        tp.cong_ctrl.flags.insert(RxtFlags::EARLYREXMT);
        Self::fast_retransmit(tp, ctx, ack, true);
    }

    /// Enter fast recovery and retransmit the segment at `ack`.
    pub fn fast_retransmit(
        tp: &mut TcpConnectionState,
        ctx: &mut WorkerContext,
        ack: u32,
        fast_sack_rexmt: bool,
    ) {
        let maxseg = tp.maxseg();
        if ctx.config.eifel_detect && tp.conn_mgmt.has(ConnFlags::RCVD_TSTMP) {
            tp.rtt.save_for_eifel(ctx.config.eifel_rtoinc);
            tp.cong_ctrl.save(tp.rod.snd_max, ctx.ticks, true);
            tp.cong_ctrl.flags.insert(RxtFlags::FASTREXMT);
        }

        tp.cong_ctrl.halve_ssthresh(tp.flow_ctrl.snd_wnd, maxseg);
        tp.cong_ctrl.enter_fast_recovery(tp.rod.snd_max);
        ctx.disarm(tp.id, TimerId::Rexmt);
        tp.rtt.rtttime = 0;

        let len = if tp.do_sack() {
            tp.scoreboard
                .first_unsacked_len(tp.rod.snd_una, tp.rod.snd_max)
                .min(maxseg)
        } else {
            maxseg
        };
        let sent = TcpTx::transmit(tp, ctx, ack, len);
        ctx.stats.inc(TcpStat::SndFastRexmt);
        debug!(
            "{}: fast retransmit at {}, ssthresh {} recover {}",
            tp.id, ack, tp.cong_ctrl.ssthresh, tp.cong_ctrl.recover
        );

        tp.cong_ctrl.cwnd = tp.cong_ctrl.ssthresh;
        tp.cong_ctrl.rexmt_high = ack.wrapping_add(sent);
        tp.reass.sack_flags.remove(SackFlags::SACKRESCUED);

        if tp.do_sack() {
            if fast_sack_rexmt {
                Self::sack_rexmt(tp, ctx, false);
            }
        } else {
            let extra = tp.cong_ctrl.dupacks.saturating_sub(tp.cong_ctrl.snd_limited);
            tp.cong_ctrl.cwnd = tp.cong_ctrl.cwnd.saturating_add(maxseg * extra);
        }
    }

    /// SACK recovery: retransmit what the scoreboard reports lost (and
    /// then new data) while the pipe leaves room in `cwnd`. With `force`
    /// the first hole is retransmitted even if the pipe is full.
    pub fn sack_rexmt(tp: &mut TcpConnectionState, ctx: &mut WorkerContext, force: bool) {
        let maxseg = tp.maxseg();
        let cwnd = tp.cong_ctrl.cwnd;
        let maxrexmt = if force {
            let unsacked = tp.scoreboard.first_unsacked_len(tp.rod.snd_una, tp.rod.snd_max);
            howmany(unsacked, maxseg).min(ctx.config.force_sackrxt)
        } else {
            0
        };

        tp.rtt.rtttime = 0;
        let mut pipe = tp.scoreboard.compute_pipe(&sack_cursor(tp));
        let (mut nseg, mut nseg_rexmt) = (0u32, 0u32);

        loop {
            let room = (cwnd as i64 - pipe as i64) >= maxseg as i64;
            let forced = force && nseg_rexmt < maxrexmt && nseg == 0;
            if !(room || forced) {
                break;
            }
            if ctx.config.smart_sack && nseg >= ctx.config.sack_maxburst {
                break;
            }
            let Some(next) = tp.scoreboard.next_segment(&sack_cursor(tp)) else {
                break;
            };
            // One rescue per recovery, and never behind other segments.
            if next.rescue && (nseg_rexmt > 0 || nseg > 0) {
                break;
            }
            let old_snd_max = tp.rod.snd_max;
            if next.seq == old_snd_max {
                nseg += 1;
            } else {
                nseg_rexmt += 1;
            }
            if next.seq == tp.rod.snd_una {
                ctx.disarm(tp.id, TimerId::Rexmt);
            }
            tp.conn_mgmt.flags.insert(ConnFlags::XMITNOW);
            let sent = TcpTx::transmit(tp, ctx, next.seq, next.len);
            if sent == 0 {
                break;
            }
            pipe += sent;
            ctx.stats.inc(TcpStat::SndSackPack);
            ctx.stats.add(TcpStat::SndSackByte, u64::from(sent));

            let end = next.seq.wrapping_add(sent);
            if next.rescue {
                ctx.stats.inc(TcpStat::SackRescue);
                tp.cong_ctrl.rexmt_rescue = end;
                tp.reass.sack_flags.insert(SackFlags::SACKRESCUED);
                break;
            }
            if seq_lt(next.seq, old_snd_max) && seq_lt(tp.cong_ctrl.rexmt_high, end) {
                tp.cong_ctrl.rexmt_high = seq_min(end, old_snd_max);
                if ctx.config.aggressive_rescuesack
                    && tp.reass.sack_flags.contains(SackFlags::SACKRESCUED)
                    && seq_lt(tp.cong_ctrl.rexmt_rescue, tp.cong_ctrl.rexmt_high)
                {
                    // Drag the rescue point along with the retransmissions.
                    tp.cong_ctrl.rexmt_rescue = tp.cong_ctrl.rexmt_high;
                }
            }
        }
        tp.conn_mgmt.flags.remove(ConnFlags::XMITNOW);
    }

    /// RFC 6675 limited transmit: send new data while the pipe is below
    /// `cwnd`. Returns true when anything went out.
    pub fn sack_limitedxmit(tp: &mut TcpConnectionState, ctx: &mut WorkerContext) -> bool {
        let maxseg = tp.maxseg();
        tp.cong_ctrl.rexmt_high = tp.rod.snd_una.wrapping_sub(1);
        let pipe = tp.scoreboard.compute_pipe(&sack_cursor(tp));
        let mut left = tp.cong_ctrl.cwnd as i64 - pipe as i64;
        if left < maxseg as i64 {
            return false;
        }
        if ctx.config.smart_sack {
            left = left.min(maxseg as i64 * ctx.config.sack_maxburst as i64);
        }
        let len = (left as u32 / maxseg) * maxseg;

        let (old_nxt, old_max) = (tp.rod.snd_nxt, tp.rod.snd_max);
        let sent = TcpTx::transmit(tp, ctx, old_max, len);
        if seq_lt(old_nxt, old_max) {
            tp.rod.snd_nxt = old_nxt;
        }
        if sent > 0 {
            ctx.stats.add(TcpStat::SndLimited, u64::from(howmany(sent, maxseg)));
            return true;
        }
        false
    }

    /// NewReno partial ack: retransmit the next segment right away and
    /// deflate `cwnd` by what the ack covered.
    pub fn newreno_partial_ack(
        tp: &mut TcpConnectionState,
        ctx: &mut WorkerContext,
        ack: u32,
        acked: u32,
    ) {
        let maxseg = tp.maxseg();
        let ocwnd = tp.cong_ctrl.cwnd;
        ctx.disarm(tp.id, TimerId::Rexmt);
        tp.rtt.rtttime = 0;
        tp.conn_mgmt.flags.insert(ConnFlags::ACKNOW);
        TcpTx::transmit(tp, ctx, ack, maxseg);
        tp.cong_ctrl.deflate_partial(ocwnd, acked, maxseg);
        debug!("{}: partial ack {}, cwnd {}", tp.id, ack, tp.cong_ctrl.cwnd);
    }

    /// RFC 5827: with too little outstanding to ever collect `rxtthresh`
    /// dup acks, a smaller count is enough. Timestamps are required so a
    /// spurious retransmission can be undone.
    pub fn need_early_retransmit(tp: &TcpConnectionState, ctx: &WorkerContext, dupacks: u32) -> bool {
        let maxseg = tp.maxseg();
        let ownd = tp.rod.outstanding();
        if !(ctx.config.early_retransmit
            && ctx.config.eifel_detect
            && tp.conn_mgmt.has(ConnFlags::RCVD_TSTMP))
        {
            return false;
        }
        if ownd >= (tp.cong_ctrl.rxtthresh + 1) * maxseg {
            return false;
        }
        if dupacks + 1 < howmany(ownd, maxseg) {
            return false;
        }
        !tp.do_sack() || ownd <= maxseg || tp.scoreboard.has_sacked(ownd - maxseg)
    }
}
