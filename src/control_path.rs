//! TCP Control Path
//!
//! Handles connection setup, teardown, and state transitions.
//! This is the ONLY component that changes `TcpConnectionState::state`.
//!
//! Every decision here is driven by flag and sequence tests the receive
//! pipeline has already made; the functions below only apply them.

use log::{debug, trace};

use crate::components::initial_window;
use crate::error::ConnError;
use crate::options::OptFlags;
use crate::seq::{seq_geq, seq_gt, seq_leq};
use crate::services::TimerId;
use crate::state::{ConnFlags, TcpConnectionState, TcpState};
use crate::stats::TcpStat;
use crate::tcp_in::TcpRx;
use crate::tcp_out::TcpTx;
use crate::tcp_proto::{TCPOLEN_TSTAMP_APPA, TCP_MINMSS};
use crate::tcp_types::{InputAction, RstReason, TcpFlags, TcpSegment, Verdict};
use crate::worker::WorkerContext;

/// Where a SYN_SENT segment continues after the handshake step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynSentNext {
    /// The segment acknowledged our SYN: process its ack.
    ProcessAck,
    /// Simultaneous open: go straight to data and FIN handling.
    Step6,
}

/// Control Path: handshake, teardown and the state transitions in between.
///
/// - Active open: SYN_SENT -> ESTABLISHED (or FIN_WAIT_1)
/// - Simultaneous open: SYN_SENT -> SYN_RCVD -> ESTABLISHED
/// - Passive open completion: SYN_RCVD -> ESTABLISHED
/// - Close: FIN_WAIT_1/2, CLOSING, CLOSE_WAIT, LAST_ACK, TIME_WAIT
pub struct ControlPath;

impl ControlPath {
    // ------------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------------

    /// Pick the segment size from the peer's MSS offer (zero when the SYN
    /// carried none) and open the initial congestion window.
    pub fn tcp_mss(tp: &mut TcpConnectionState, ctx: &WorkerContext, offer: u16) {
        let cfg = &ctx.config;
        let offer = if offer == 0 { cfg.default_mss } else { offer };
        let offer = offer.max(cfg.min_mss).max(TCP_MINMSS);
        let mut mss = cfg.default_mss.min(offer);
        if tp.conn_mgmt.timestamps_agreed() {
            mss -= TCPOLEN_TSTAMP_APPA;
        }
        let mss = u32::from(mss);
        tp.conn_mgmt.maxseg = mss;
        tp.cong_ctrl.cwnd = initial_window(mss);
        trace!("{}: maxseg {} cwnd {}", tp.id, mss, tp.cong_ctrl.cwnd);
    }

    /// Record what the peer's SYN (or SYN-ACK) negotiated while we were in
    /// SYN_SENT: window scale, timestamps, MSS and SACK.
    pub fn syn_options(tp: &mut TcpConnectionState, ctx: &WorkerContext, seg: &TcpSegment) {
        let opts = &seg.opts;
        if opts.has(OptFlags::SCALE) && tp.conn_mgmt.has(ConnFlags::REQ_SCALE) {
            tp.conn_mgmt.flags.insert(ConnFlags::RCVD_SCALE);
            tp.flow_ctrl.requested_s_scale = opts.requested_s_scale;
        }
        if opts.has(OptFlags::TS) {
            tp.conn_mgmt.flags.insert(ConnFlags::RCVD_TSTMP);
            tp.rod.record_ts(opts.tsval, ctx.ticks);
        }
        // Windows on SYNs are never scaled.
        tp.flow_ctrl.snd_wnd = u32::from(seg.wnd);
        let offer = if opts.has(OptFlags::MSS) { opts.mss } else { 0 };
        Self::tcp_mss(tp, ctx, offer);
        if ctx.config.sack && opts.has(OptFlags::SACK_PERMITTED) {
            tp.conn_mgmt.flags.insert(ConnFlags::SACK_PERMITTED);
        }
    }

    /// Enter ESTABLISHED and start the keepalive clock. If the handshake
    /// needed SYN retransmissions, the RTO restarts from at least 3s.
    pub fn established(tp: &mut TcpConnectionState, ctx: &mut WorkerContext) {
        tp.conn_mgmt.set_state(tp.id, TcpState::Established);
        let keep_idle = tp.conn_mgmt.keep_idle;
        ctx.arm(tp.id, TimerId::Keep, keep_idle);
        if tp.rtt.rxtsyn > 0 && tp.rtt.rxtcur < ctx.config.rtobase3 {
            tp.rtt.rxtcur = ctx.config.rtobase3;
        }
    }

    /// Handle a segment in SYN_SENT. On success the segment has had its SYN
    /// consumed (sequence advanced past it) and was trimmed to the window.
    pub fn syn_sent(
        tp: &mut TcpConnectionState,
        ctx: &mut WorkerContext,
        seg: &mut TcpSegment,
    ) -> Verdict<SynSentNext> {
        let has_ack = seg.flags.contains(TcpFlags::ACK);
        if has_ack && (seq_leq(seg.ackno, tp.rod.iss) || seq_gt(seg.ackno, tp.rod.snd_max)) {
            return Err(InputAction::DropWithReset(RstReason::Unlimited));
        }
        if seg.flags.contains(TcpFlags::RST) {
            if has_ack {
                debug!("{}: connection refused", tp.id);
                Self::drop(tp, ctx, ConnError::Refused);
            }
            return Err(InputAction::DropSilently);
        }
        if !seg.flags.contains(TcpFlags::SYN) {
            return Err(InputAction::DropSilently);
        }

        tp.rod.on_peer_syn(seg.seqno);
        if has_ack {
            ctx.stats.inc(TcpStat::Connects);
            if tp.conn_mgmt.scaling_agreed() {
                tp.flow_ctrl.apply_scaling();
            }
            tp.rod.rcv_adv = tp.rod.rcv_adv.wrapping_add(tp.flow_ctrl.rcv_wnd);
            tp.rod.snd_una = tp.rod.snd_una.wrapping_add(1);
            ctx.disarm(tp.id, TimerId::Rexmt);

            // Data on the SYN-ACK may wait for a delayed ack; a FIN will
            // force an immediate one later.
            if TcpTx::delay_ack(tp, ctx) && !seg.is_empty() {
                TcpTx::schedule_delack(tp, ctx);
            } else {
                tp.conn_mgmt.flags.insert(ConnFlags::ACKNOW);
            }

            tp.conn_mgmt.starttime = ctx.ticks;
            if tp.conn_mgmt.has(ConnFlags::NEEDFIN) {
                tp.conn_mgmt.set_state(tp.id, TcpState::FinWait1);
                tp.conn_mgmt.flags.remove(ConnFlags::NEEDFIN);
                seg.flags.remove(TcpFlags::SYN);
            } else {
                Self::established(tp, ctx);
            }
        } else {
            // Simultaneous open.
            tp.conn_mgmt.flags.insert(ConnFlags::ACKNOW);
            ctx.disarm(tp.id, TimerId::Rexmt);
            tp.conn_mgmt.set_state(tp.id, TcpState::SynRcvd);
        }

        // Skip the SYN; keep only what fits the window.
        seg.seqno = seg.seqno.wrapping_add(1);
        let rcv_wnd = tp.flow_ctrl.rcv_wnd;
        if seg.len() > rcv_wnd {
            let todrop = seg.len() - rcv_wnd;
            seg.trim_back(todrop);
            seg.flags.remove(TcpFlags::FIN);
            ctx.stats.inc(TcpStat::RcvPackAfterWin);
            ctx.stats.add(TcpStat::RcvByteAfterWin, u64::from(todrop));
        }
        tp.flow_ctrl.snd_wl1 = seg.seqno.wrapping_sub(1);
        tp.rod.rcv_up = seg.seqno;

        Ok(if has_ack { SynSentNext::ProcessAck } else { SynSentNext::Step6 })
    }

    /// The final ack of the handshake in SYN_RCVD was acceptable.
    pub fn synrcvd_ack(tp: &mut TcpConnectionState, ctx: &mut WorkerContext, seg: &TcpSegment) {
        ctx.stats.inc(TcpStat::Connects);
        if tp.conn_mgmt.scaling_agreed() {
            tp.flow_ctrl.apply_scaling();
        }
        tp.conn_mgmt.starttime = ctx.ticks;
        if tp.conn_mgmt.has(ConnFlags::NEEDFIN) {
            tp.conn_mgmt.set_state(tp.id, TcpState::FinWait1);
            tp.conn_mgmt.flags.remove(ConnFlags::NEEDFIN);
        } else {
            Self::established(tp, ctx);
        }
        // Data that arrived before the handshake completed can go up now,
        // unless this segment will push it anyway.
        if seg.is_empty() && !seg.flags.contains(TcpFlags::FIN) {
            TcpRx::present(tp, ctx);
        }
    }

    // ------------------------------------------------------------------------
    // Reset
    // ------------------------------------------------------------------------

    /// A RST arrived. It only counts when its sequence number falls in
    /// `[last_ack_sent, last_ack_sent + rcv_wnd]`; the segment is dropped
    /// either way.
    pub fn process_rst(tp: &mut TcpConnectionState, ctx: &mut WorkerContext, seg: &TcpSegment) -> Verdict {
        let left = tp.rod.last_ack_sent;
        let right = left.wrapping_add(tp.flow_ctrl.rcv_wnd);
        if seq_geq(seg.seqno, left) && seq_leq(seg.seqno, right) {
            match tp.state() {
                TcpState::SynRcvd => Self::reset_close(tp, ctx, ConnError::Refused),
                TcpState::Established
                | TcpState::FinWait1
                | TcpState::FinWait2
                | TcpState::CloseWait => Self::reset_close(tp, ctx, ConnError::Reset),
                TcpState::Closing | TcpState::LastAck => Self::close(tp, ctx),
                // TIME_WAIT runs out its 2MSL regardless.
                TcpState::TimeWait => trace!("{}: RST in TIME_WAIT ignored", tp.id),
                _ => {}
            }
        } else {
            trace!("{}: RST seq {} outside [{}, {}]", tp.id, seg.seqno, left, right);
        }
        Err(InputAction::DropSilently)
    }

    fn reset_close(tp: &mut TcpConnectionState, ctx: &mut WorkerContext, err: ConnError) {
        debug!("{}: {} in {:?}", tp.id, err, tp.state());
        tp.rcvbuf.set_error(err);
        ctx.stats.inc(TcpStat::Drops);
        Self::close(tp, ctx);
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Our FIN was (or was not) acknowledged by an accepted ack; advance
    /// the closing states accordingly.
    pub fn on_ack_transitions(
        tp: &mut TcpConnectionState,
        ctx: &mut WorkerContext,
        ourfinisacked: bool,
    ) -> Verdict {
        match tp.state() {
            TcpState::FinWait1 if ourfinisacked => {
                // Receive side already shut: the peer gets max_idle to
                // send its FIN, then we give up.
                if tp.rcvbuf.cant_receive_more() {
                    let max_idle = tp.conn_mgmt.max_idle;
                    ctx.arm(tp.id, TimerId::TwoMsl, max_idle);
                }
                tp.conn_mgmt.set_state(tp.id, TcpState::FinWait2);
            }
            TcpState::Closing if ourfinisacked => {
                Self::enter_time_wait(tp, ctx);
            }
            TcpState::LastAck if ourfinisacked => {
                Self::close(tp, ctx);
                return Err(InputAction::DropSilently);
            }
            TcpState::TimeWait => {
                // Only a retransmitted FIN can get here: ack it again.
                Self::restart_2msl(tp, ctx);
                return Err(InputAction::DropWithAck);
            }
            _ => {}
        }
        Ok(())
    }

    /// Consume the peer's FIN (after any data it trailed).
    pub fn process_fin(tp: &mut TcpConnectionState, ctx: &mut WorkerContext) {
        if !tp.state().have_rcvd_fin() {
            tp.rcvbuf.mark_cant_receive_more();
            // Half-synchronized: the ack can ride on our SYN.
            if TcpTx::delay_ack(tp, ctx) && tp.conn_mgmt.has(ConnFlags::NEEDSYN) {
                TcpTx::schedule_delack(tp, ctx);
            } else {
                tp.conn_mgmt.flags.insert(ConnFlags::ACKNOW);
            }
            tp.rod.advance_rcv_nxt(1);
        }
        match tp.state() {
            TcpState::SynRcvd => {
                tp.conn_mgmt.starttime = ctx.ticks;
                tp.conn_mgmt.set_state(tp.id, TcpState::CloseWait);
            }
            TcpState::Established => tp.conn_mgmt.set_state(tp.id, TcpState::CloseWait),
            TcpState::FinWait1 => tp.conn_mgmt.set_state(tp.id, TcpState::Closing),
            TcpState::FinWait2 => Self::enter_time_wait(tp, ctx),
            TcpState::TimeWait => Self::restart_2msl(tp, ctx),
            _ => {}
        }
    }

    fn enter_time_wait(tp: &mut TcpConnectionState, ctx: &mut WorkerContext) {
        tp.conn_mgmt.set_state(tp.id, TcpState::TimeWait);
        ctx.disarm_all(tp.id);
        Self::restart_2msl(tp, ctx);
    }

    fn restart_2msl(tp: &mut TcpConnectionState, ctx: &mut WorkerContext) {
        let ticks = 2 * ctx.config.msl;
        ctx.arm(tp.id, TimerId::TwoMsl, ticks);
    }

    /// Tear the connection down: stop its timers, forget pending output,
    /// free the reassembly queue and scoreboard, shut the receive side and
    /// enter CLOSED. The owner detaches the control block afterwards.
    pub fn close(tp: &mut TcpConnectionState, ctx: &mut WorkerContext) {
        ctx.stats.inc(TcpStat::Closed);
        ctx.disarm_all(tp.id);
        ctx.forget_pending(tp.id);
        ctx.output.cancel_pending_output(tp.id);
        let freed = tp.reass.clear();
        ctx.reass_release(freed);
        tp.scoreboard.clear();
        tp.rcvbuf.mark_cant_receive_more();
        tp.conn_mgmt.set_state(tp.id, TcpState::Closed);
    }

    /// Abort the connection, reporting `err` to the socket.
    pub fn drop(tp: &mut TcpConnectionState, ctx: &mut WorkerContext, err: ConnError) {
        if tp.state() >= TcpState::SynRcvd {
            ctx.stats.inc(TcpStat::Drops);
        } else {
            ctx.stats.inc(TcpStat::ConnDrops);
        }
        debug!("{}: dropped in {:?}: {}", tp.id, tp.state(), err);
        tp.rcvbuf.set_error(err);
        Self::close(tp, ctx);
    }
}
