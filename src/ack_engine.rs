//! ACK & Window-Update Engine
//!
//! Everything the acknowledgment field of an accepted segment does to the
//! send side: duplicate detection, SACK scoreboard updates, spurious
//! retransmission detection, RTT sampling, releasing acknowledged bytes,
//! window updates and handing `cwnd` decisions to the recovery logic.

use log::{debug, trace};

use crate::control_path::ControlPath;
use crate::options::{OptFlags, TcpOptions};
use crate::recovery::Recovery;
use crate::seq::{seq_gt, seq_leq, seq_lt, tstmp_lt};
use crate::services::TimerId;
use crate::state::{ConnFlags, RxtFlags, TcpConnectionState};
use crate::stats::TcpStat;
use crate::tcp_types::{InputAction, SegmentCtx, TcpFlags, TcpSegment, Verdict};
use crate::worker::WorkerContext;

/// ACK Engine
pub struct AckEngine;

impl AckEngine {
    /// Handle the ack field of a segment in a synchronized state.
    pub fn on_ack(
        tp: &mut TcpConnectionState,
        ctx: &mut WorkerContext,
        seg: &mut TcpSegment,
        sc: &mut SegmentCtx,
    ) -> Verdict {
        if seq_leq(seg.ackno, tp.rod.snd_una) {
            return Self::on_duplicate_ack(tp, ctx, seg, sc);
        }
        Self::on_new_ack(tp, ctx, seg, sc)
    }

    /// The ack does not advance `snd_una`.
    pub fn on_duplicate_ack(
        tp: &mut TcpConnectionState,
        ctx: &mut WorkerContext,
        seg: &mut TcpSegment,
        sc: &mut SegmentCtx,
    ) -> Verdict {
        if tp.do_sack() {
            Self::update_scoreboard(tp, ctx, &mut seg.opts);
        }
        let fin = seg.flags.contains(TcpFlags::FIN);
        let maynotdup = !seg.is_empty()
            || sc.tiwin != tp.flow_ctrl.snd_wnd
            || (fin && !tp.conn_mgmt.has(ConnFlags::SAWFIN));

        if !ctx.is_armed(tp.id, TimerId::Rexmt) || seg.ackno != tp.rod.snd_una {
            // Nothing outstanding, or an old ack: not a loss signal.
            if !maynotdup {
                ctx.stats.inc(TcpStat::RcvDupAck);
            }
            tp.cong_ctrl.dupacks = 0;
            return Ok(());
        }

        if maynotdup {
            let only_new_sack = (seg.opts.flags & (OptFlags::SACK | OptFlags::SACK_REDUNDANT))
                == OptFlags::SACK;
            if ctx.config.rfc6675 && tp.do_sack() && only_new_sack {
                // Fresh SACK info rides on data; count it after the data
                // has been queued.
                sc.delayed_dupack = true;
            } else {
                tp.cong_ctrl.dupacks = 0;
            }
            return Ok(());
        }

        if fin && !tp.conn_mgmt.has(ConnFlags::QUEDFIN) {
            sc.delayed_dupack = true;
            return Ok(());
        }

        if Recovery::recv_dupack(tp, ctx, seg.ackno, &seg.opts) {
            return Err(InputAction::DropSilently);
        }
        Ok(())
    }

    /// The ack advances `snd_una`.
    fn on_new_ack(
        tp: &mut TcpConnectionState,
        ctx: &mut WorkerContext,
        seg: &mut TcpSegment,
        sc: &mut SegmentCtx,
    ) -> Verdict {
        tp.cong_ctrl.dupacks = 0;
        if seq_gt(seg.ackno, tp.rod.snd_max) {
            // Acks for data never sent: optimistic ack attack, or garbage.
            debug!(
                "{}: ack {} beyond snd_max {}, collapsing cwnd",
                tp.id, seg.ackno, tp.rod.snd_max
            );
            let maxseg = tp.maxseg();
            tp.cong_ctrl.collapse(maxseg);
            ctx.stats.inc(TcpStat::RcvAckTooMuch);
            return Err(InputAction::DropWithAck);
        }
        if tp.conn_mgmt.has(ConnFlags::NEEDSYN) {
            // Our SYN is acked by this segment (T/TCP style half-sync).
            tp.conn_mgmt.flags.remove(ConnFlags::NEEDSYN);
            tp.rod.snd_una = tp.rod.snd_una.wrapping_add(1);
            if tp.conn_mgmt.scaling_agreed() {
                tp.flow_ctrl.apply_scaling();
            }
        }
        Self::process_ack(tp, ctx, seg, sc)
    }

    /// Consume an ack that covers new data (or nothing at all, right after
    /// the handshake): detect a spurious retransmission, sample the RTT,
    /// release acked bytes, update the window and `cwnd`, re-arm the
    /// retransmit timer, and run the state transitions an acked FIN causes.
    pub fn process_ack(
        tp: &mut TcpConnectionState,
        ctx: &mut WorkerContext,
        seg: &mut TcpSegment,
        sc: &mut SegmentCtx,
    ) -> Verdict {
        let ack = seg.ackno;
        let acked = ack.wrapping_sub(tp.rod.snd_una);
        let maxseg = tp.maxseg();
        ctx.stats.inc(TcpStat::RcvAckPack);
        ctx.stats.add(TcpStat::RcvAckByte, u64::from(acked));

        Self::detect_spurious(tp, ctx, &seg.opts, acked);
        Self::sample_rtt(tp, ctx, &seg.opts, ack);

        if acked == 0 {
            return Ok(());
        }
        tp.cong_ctrl.clear_rxt_flags();

        let (released, fin_acked) = tp.rod.drop_acked(acked);
        tp.flow_ctrl.snd_wnd = tp.flow_ctrl.snd_wnd.saturating_sub(released);
        sc.ourfinisacked = fin_acked;

        if tp.flow_ctrl.acceptable_window_update(seg.seqno, ack, sc.tiwin) {
            if tp.flow_ctrl.apply_window_update(seg.seqno, ack, sc.tiwin, seg.is_empty()) {
                ctx.stats.inc(TcpStat::RcvWinUpd);
            }
            sc.needoutput = true;
        }

        tp.rod.snd_una = ack;
        if tp.do_sack() {
            Self::update_scoreboard(tp, ctx, &mut seg.opts);
        }

        if tp.in_fast_recovery() {
            if !seq_lt(ack, tp.cong_ctrl.recover) {
                let (snd_una, snd_max, sack) = (tp.rod.snd_una, tp.rod.snd_max, tp.do_sack());
                tp.cong_ctrl.exit_recovery_on_ack(ack, snd_una, snd_max, maxseg, sack);
                debug!("{}: recovery done at {}, cwnd {}", tp.id, ack, tp.cong_ctrl.cwnd);
                sc.needoutput = true;
            } else {
                if tp.do_sack() {
                    let force = tp.rod.snd_una == tp.cong_ctrl.rexmt_high;
                    Recovery::sack_rexmt(tp, ctx, force);
                } else {
                    Recovery::newreno_partial_ack(tp, ctx, ack, acked);
                }
                sc.needoutput = false;
            }
        } else {
            let retransmitting = seq_lt(tp.rod.snd_nxt, tp.rod.snd_max);
            let max_cwnd = tp.flow_ctrl.max_cwnd();
            tp.cong_ctrl.grow(acked, maxseg, ctx.config.abc, retransmitting, max_cwnd);
            tp.cong_ctrl.recover = ack.wrapping_sub(1);
        }
        if seq_lt(tp.rod.snd_nxt, tp.rod.snd_una) {
            tp.rod.snd_nxt = tp.rod.snd_una;
        }

        Self::rearm_rexmt(tp, ctx, ack);
        if ack == tp.rod.snd_max {
            sc.needoutput = true;
        }

        ControlPath::on_ack_transitions(tp, ctx, sc.ourfinisacked)
    }

    /// Stop the retransmit timer when everything is acked, otherwise
    /// restart it with the current (possibly backed-off) timeout. A
    /// running persist timer owns the connection and is left alone.
    pub fn rearm_rexmt(tp: &mut TcpConnectionState, ctx: &mut WorkerContext, ack: u32) {
        if ack == tp.rod.snd_max {
            ctx.disarm(tp.id, TimerId::Rexmt);
        } else if !ctx.is_armed(tp.id, TimerId::Persist) {
            let rxtcur = tp.rtt.rxtcur;
            ctx.arm(tp.id, TimerId::Rexmt, rxtcur);
        }
    }

    // ------------------------------------------------------------------------
    // Spurious retransmission & RTT
    // ------------------------------------------------------------------------

    /// Eifel detection: the first acceptable ack after a retransmission
    /// echoes a timestamp older than the retransmission, so it was sent
    /// for the original. Without timestamps, an ack arriving within the
    /// bad-retransmit window of the first RTO is taken as the same hint.
    pub fn detect_spurious(
        tp: &mut TcpConnectionState,
        ctx: &mut WorkerContext,
        opts: &TcpOptions,
        acked: u32,
    ) {
        let cc = &tp.cong_ctrl;
        if ctx.config.eifel_detect
            && acked > 0
            && opts.has(OptFlags::TS)
            && opts.tsecr != 0
            && cc.flags.contains(RxtFlags::FIRSTACCACK)
        {
            if tstmp_lt(opts.tsecr, cc.rexmt_ts) {
                ctx.stats.inc(TcpStat::EifelDetected);
                Self::revert(tp, ctx);
            }
        } else if tp.rtt.rxtshift == 1 && tstmp_lt(ctx.ticks, cc.badrxtwin) {
            Self::revert(tp, ctx);
        }
    }

    /// Undo the congestion reaction to a spurious retransmission.
    pub fn revert(tp: &mut TcpConnectionState, ctx: &mut WorkerContext) {
        debug!(
            "{}: spurious retransmission, reverting cwnd {} -> {}",
            tp.id, tp.cong_ctrl.cwnd, tp.cong_ctrl.cwnd_prev
        );
        tp.cong_ctrl.revert(ctx.config.eifel_response);
        tp.rtt.rxtshift = 0;
        tp.rod.snd_nxt = tp.rod.snd_max;
        if tp.do_sack() {
            tp.scoreboard.revert(tp.rod.snd_una);
        }
        ctx.stats.inc(TcpStat::RexmtBad);
    }

    /// Take an RTT sample from the timestamp echo, or from the timed
    /// sequence when the ack covers it.
    pub fn sample_rtt(tp: &mut TcpConnectionState, ctx: &mut WorkerContext, opts: &TcpOptions, ack: u32) {
        let rtt = if opts.has(OptFlags::TS) && opts.tsecr != 0 {
            ctx.ticks.wrapping_sub(opts.tsecr).wrapping_add(1)
        } else if tp.rtt.rtttime != 0 && seq_gt(ack, tp.rtt.rtseq) {
            ctx.ticks.wrapping_sub(tp.rtt.rtttime)
        } else {
            return;
        };
        // An echo this old is stale or forged.
        if rtt > ctx.config.rexmt_max {
            trace!("{}: rtt sample {} above rexmt_max, ignored", tp.id, rtt);
            tp.rtt.rtttime = 0;
            return;
        }
        let rebase = tp.cong_ctrl.take_rebase(ack);
        tp.rtt.xmit_timer(rtt as i32, rebase, ctx.config.rexmt_max, ctx.config.eifel_rtoinc);
        ctx.stats.inc(TcpStat::RttUpdated);
        if rebase {
            ctx.stats.inc(TcpStat::EifelResponse);
        }
    }

    // ------------------------------------------------------------------------
    // SACK scoreboard
    // ------------------------------------------------------------------------

    /// Feed the segment's SACK blocks to the scoreboard. A leading D-SACK
    /// block reports a duplicate and is not recorded. When no block told
    /// the scoreboard anything new the option is marked redundant.
    pub fn update_scoreboard(tp: &mut TcpConnectionState, ctx: &mut WorkerContext, opts: &mut TcpOptions) {
        let (snd_una, snd_max) = (tp.rod.snd_una, tp.rod.snd_max);
        tp.scoreboard.advance(snd_una);
        if !opts.has(OptFlags::SACK) {
            return;
        }
        let skip = usize::from(opts.has(OptFlags::DSACK));
        let mut new_info = false;
        for blk in opts.sack_blocks.iter().skip(skip) {
            new_info |= tp.scoreboard.record_block(*blk, snd_una, snd_max);
        }
        if !new_info {
            opts.flags.insert(OptFlags::SACK_REDUNDANT);
        }
        let (maxseg, rxtthresh) = (tp.maxseg(), tp.cong_ctrl.rxtthresh);
        tp.scoreboard.update_lost_seq(snd_una, maxseg, rxtthresh);
        ctx.stats.inc(TcpStat::SackSbUpdate);
        trace!("{}: scoreboard updated, redundant {}", tp.id, !new_info);
    }
}
