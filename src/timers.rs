//! Connection Timers
//!
//! The input engine arms timers through the worker's `TimerService`; the
//! embedding stack calls back into `TcpTimers::fire` when one expires. Each
//! handler leaves the connection CLOSED when it gives up on it, and the
//! caller detaches it then.

use log::{debug, trace};

use crate::control_path::ControlPath;
use crate::error::ConnError;
use crate::services::TimerId;
use crate::state::{ConnFlags, TcpConnectionState, TcpState};
use crate::stats::TcpStat;
use crate::tcp_out::TcpTx;
use crate::worker::WorkerContext;

/// Keepalive probes sent before an idle connection is dropped.
const TCP_KEEPCNT: u32 = 8;

/// Timer expiry handlers
pub struct TcpTimers;

impl TcpTimers {
    /// Run the handler for `timer`. Returns true when the connection was
    /// closed and should be detached.
    pub fn fire(tp: &mut TcpConnectionState, ctx: &mut WorkerContext, timer: TimerId) -> bool {
        trace!("{}: {:?} timer fired in {:?}", tp.id, timer, tp.state());
        match timer {
            TimerId::Rexmt => Self::on_retransmit_timeout(tp, ctx),
            TimerId::Delack => Self::on_delack_timeout(tp, ctx),
            TimerId::TwoMsl => Self::on_2msl_timeout(tp, ctx),
            TimerId::Keep => Self::on_keepalive_timeout(tp, ctx),
            // Window probes belong to the output side.
            TimerId::Persist => ctx.output.request_output(tp.id),
        }
        tp.state() == TcpState::Closed
    }

    /// Retransmit timeout: back off, shrink the congestion window to one
    /// segment and resend from `snd_una`. The state before the first
    /// timeout is saved so a spurious one can be undone.
    pub fn on_retransmit_timeout(tp: &mut TcpConnectionState, ctx: &mut WorkerContext) {
        let syn = tp.state() < TcpState::Established;
        if !tp.rtt.backoff(syn, ctx.config.rexmt_max) {
            ctx.stats.inc(TcpStat::TimeoutDrop);
            if tp.state() >= TcpState::SynRcvd {
                TcpTx::reset_connection(tp, ctx);
            }
            ControlPath::drop(tp, ctx, ConnError::TimedOut);
            return;
        }

        if tp.rtt.rxtshift == 1 {
            let timestamps = tp.conn_mgmt.has(ConnFlags::RCVD_TSTMP);
            tp.cong_ctrl.save(tp.rod.snd_max, ctx.ticks, timestamps);
            tp.rtt.save_for_eifel(ctx.config.eifel_rtoinc);
            // srtt is scaled by 32; half of it is the window for a late ack.
            tp.cong_ctrl.badrxtwin = ctx.ticks.wrapping_add((tp.rtt.srtt >> 6) as u32);
            if tp.do_sack() {
                tp.scoreboard.save();
            }
        }
        if syn {
            tp.rtt.rxtsyn += 1;
        }

        tp.rod.snd_nxt = tp.rod.snd_una;
        tp.cong_ctrl.rexmt_high = tp.rod.snd_una;
        tp.cong_ctrl.recover = tp.rod.snd_max;
        tp.conn_mgmt.flags.insert(ConnFlags::ACKNOW);
        tp.rtt.rtttime = 0;
        let (snd_wnd, maxseg) = (tp.flow_ctrl.snd_wnd, tp.maxseg());
        tp.cong_ctrl.on_timeout(snd_wnd, maxseg);
        tp.scoreboard.clear();
        ctx.stats.inc(TcpStat::RexmtTimeo);
        debug!(
            "{}: retransmit timeout #{}, rto {} ssthresh {}",
            tp.id, tp.rtt.rxtshift, tp.rtt.rxtcur, tp.cong_ctrl.ssthresh
        );

        let rxtcur = tp.rtt.rxtcur;
        ctx.arm(tp.id, TimerId::Rexmt, rxtcur);
        TcpTx::output(tp, ctx, true);
    }

    /// The delayed ack is due.
    pub fn on_delack_timeout(tp: &mut TcpConnectionState, ctx: &mut WorkerContext) {
        if !tp.conn_mgmt.has(ConnFlags::DELACK) {
            return;
        }
        ctx.stats.inc(TcpStat::DelAck);
        tp.conn_mgmt.flags.insert(ConnFlags::ACKNOW);
        TcpTx::output(tp, ctx, false);
    }

    /// TIME_WAIT is over, or a FIN_WAIT_2 peer went silent.
    pub fn on_2msl_timeout(tp: &mut TcpConnectionState, ctx: &mut WorkerContext) {
        let idle = ctx.ticks.wrapping_sub(tp.conn_mgmt.rcvtime);
        if tp.state() == TcpState::FinWait2 && idle < tp.conn_mgmt.max_idle {
            let ticks = Self::keep_interval(tp);
            ctx.arm(tp.id, TimerId::TwoMsl, ticks);
            return;
        }
        ControlPath::close(tp, ctx);
    }

    /// Probe an idle connection, or drop it once the probes went
    /// unanswered for `max_idle` ticks.
    pub fn on_keepalive_timeout(tp: &mut TcpConnectionState, ctx: &mut WorkerContext) {
        if tp.state() < TcpState::Established {
            Self::keep_drop(tp, ctx);
            return;
        }
        if tp.state() > TcpState::Closing {
            let ticks = tp.conn_mgmt.keep_idle;
            ctx.arm(tp.id, TimerId::Keep, ticks);
            return;
        }
        let idle = ctx.ticks.wrapping_sub(tp.conn_mgmt.rcvtime);
        if idle >= tp.conn_mgmt.keep_idle.saturating_add(tp.conn_mgmt.max_idle) {
            Self::keep_drop(tp, ctx);
            return;
        }
        trace!("{}: keepalive probe after {} idle ticks", tp.id, idle);
        ctx.output.request_ack_now(tp.id);
        let ticks = Self::keep_interval(tp);
        ctx.arm(tp.id, TimerId::Keep, ticks);
    }

    fn keep_drop(tp: &mut TcpConnectionState, ctx: &mut WorkerContext) {
        ctx.stats.inc(TcpStat::KeepDrop);
        if tp.state() >= TcpState::SynRcvd {
            TcpTx::reset_connection(tp, ctx);
        }
        ControlPath::drop(tp, ctx, ConnError::TimedOut);
    }

    fn keep_interval(tp: &TcpConnectionState) -> u32 {
        (tp.conn_mgmt.max_idle / TCP_KEEPCNT).max(1)
    }
}
