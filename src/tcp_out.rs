//! TCP Output Requests (TX Path)
//!
//! The engine never builds data segments itself. It decides *that* output
//! must happen and hands the decision to the injected `OutputScheduler`:
//! an immediate ack, a run of the output routine, a queued (aggregated)
//! ack, or a reset in response to an unacceptable segment.

use log::{debug, trace};

use crate::net_header::NetworkHeaderView;
use crate::seq::seq_gt;
use crate::services::TimerId;
use crate::state::{ConnFlags, TcpConnectionState, TcpState};
use crate::stats::TcpStat;
use crate::tcp_types::{FourTuple, RstReason, TcpFlags, TcpSegment};
use crate::worker::WorkerContext;

/// A reset to transmit, addressed from the local end to the remote end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetSegment {
    pub tuple: FourTuple,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
}

/// TCP TX Path
///
/// Output decisions for a connection, and resets for segments that have
/// none.
pub struct TcpTx;

impl TcpTx {
    // ------------------------------------------------------------------------
    // Acknowledgments
    // ------------------------------------------------------------------------

    /// A delayed ack is allowed: delayed acks are on, the delayed-ack
    /// timer is idle (so every other segment is acked at once), and our
    /// last advertisement was not a zero window.
    pub fn delay_ack(tp: &TcpConnectionState, ctx: &WorkerContext) -> bool {
        ctx.config.delayed_ack
            && !ctx.is_armed(tp.id, TimerId::Delack)
            && !tp.conn_mgmt.has(ConnFlags::RXWIN0SENT)
    }

    /// Arm the delayed-ack timer.
    pub fn schedule_delack(tp: &mut TcpConnectionState, ctx: &mut WorkerContext) {
        tp.conn_mgmt.flags.insert(ConnFlags::DELACK);
        let ticks = ctx.config.delack_ticks;
        ctx.arm(tp.id, TimerId::Delack, ticks);
    }

    /// Bookkeeping for an ack that is about to carry `rcv_nxt`.
    fn note_ack_sent(tp: &mut TcpConnectionState, ctx: &mut WorkerContext) {
        tp.conn_mgmt.flags.remove(ConnFlags::ACKNOW | ConnFlags::DELACK | ConnFlags::RXRESIZED);
        ctx.disarm(tp.id, TimerId::Delack);
        tp.rod.last_ack_sent = tp.rod.rcv_nxt;
        let adv = tp.rod.rcv_nxt.wrapping_add(tp.flow_ctrl.rcv_wnd);
        if seq_gt(adv, tp.rod.rcv_adv) {
            tp.rod.rcv_adv = adv;
        }
        // Opens the next auto-sizing round.
        if tp.flow_ctrl.rfbuf_ts == 0 {
            tp.flow_ctrl.rfbuf_ts = ctx.ticks;
        }
    }

    /// Send `len` bytes of the stream from `seq` outside the congestion
    /// window and account for what went out. Every segment carries our
    /// ack, so a successful transmit settles any owed ack as well.
    pub fn transmit(tp: &mut TcpConnectionState, ctx: &mut WorkerContext, seq: u32, len: u32) -> u32 {
        if len == 0 {
            return 0;
        }
        let sent = ctx.output.transmit(tp.id, seq, len);
        tp.rod.on_transmitted(seq, sent);
        if sent > 0 {
            Self::note_ack_sent(tp, ctx);
            ctx.forget_pending(tp.id);
            // Data is outstanding now; it has to be timed.
            if !ctx.is_armed(tp.id, TimerId::Rexmt) {
                ctx.disarm(tp.id, TimerId::Persist);
                let rxtcur = tp.rtt.rxtcur;
                ctx.arm(tp.id, TimerId::Rexmt, rxtcur);
            }
            trace!("{}: transmitted [{}, +{})", tp.id, seq, sent);
        }
        sent
    }

    /// Put the connection on the worker's pending-output list; the ack goes
    /// out when the batch is flushed.
    pub fn queue_ack(tp: &mut TcpConnectionState, ctx: &mut WorkerContext) {
        Self::note_ack_sent(tp, ctx);
        ctx.queue_ack(tp.id);
        trace!("{}: ack queued for aggregation", tp.id);
    }

    /// Run output for the connection. An owed ack (ACKNOW) is sent now and
    /// supersedes one queued for aggregation. With `needoutput` the full
    /// output routine runs (data, window update); otherwise only the ack.
    pub fn output(tp: &mut TcpConnectionState, ctx: &mut WorkerContext, needoutput: bool) {
        let acknow = tp.conn_mgmt.has(ConnFlags::ACKNOW);
        if acknow {
            Self::note_ack_sent(tp, ctx);
            ctx.forget_pending(tp.id);
        }
        if needoutput {
            ctx.output.request_output(tp.id);
        } else if acknow {
            ctx.output.request_ack_now(tp.id);
        }
    }

    /// Output has been asked for unless an aggregated ack is already
    /// pending for the connection.
    pub fn output_unless_pending(tp: &mut TcpConnectionState, ctx: &mut WorkerContext) {
        if !ctx.is_ack_queued(tp.id) {
            ctx.output.request_output(tp.id);
        }
    }

    /// Acknowledge an unacceptable segment so the peer resynchronizes.
    ///
    /// In SYN_RECEIVED an ack outside our send window means the segment
    /// belongs to an old incarnation, and it gets a reset instead (this
    /// stops ack storms between two stale half-connections).
    pub fn drop_after_ack(
        tp: &mut TcpConnectionState,
        ctx: &mut WorkerContext,
        seg: &TcpSegment,
    ) -> Option<RstReason> {
        if tp.state() == TcpState::SynRcvd
            && seg.flags.contains(TcpFlags::ACK)
            && (seq_gt(tp.rod.snd_una, seg.ackno) || seq_gt(seg.ackno, tp.rod.snd_max))
        {
            return Some(RstReason::OpenPort);
        }
        tp.conn_mgmt.flags.insert(ConnFlags::ACKNOW);
        Self::output(tp, ctx, false);
        tp.reass.report_cleanup();
        None
    }

    // ------------------------------------------------------------------------
    // Resets
    // ------------------------------------------------------------------------

    /// Answer `seg` with a reset, unless it is a reset itself, came from or
    /// to a broadcast/multicast address, or the rate limit for `reason`
    /// is exhausted. Returns whether a reset was sent.
    ///
    /// An ack-bearing segment is answered with `RST seq=ack`; anything else
    /// with `RST|ACK` acknowledging everything the segment occupied.
    pub fn respond_reset(
        ctx: &mut WorkerContext,
        net: &dyn NetworkHeaderView,
        tuple: FourTuple,
        seg: &TcpSegment,
        reason: RstReason,
    ) -> bool {
        if seg.flags.contains(TcpFlags::RST) || net.is_broadcast_or_multicast() {
            trace!("no reset for {:?} from {}", seg.flags, tuple.remote_addr);
            return false;
        }
        if !ctx.rst_allowed(reason) {
            return false;
        }
        let rst = if seg.flags.contains(TcpFlags::ACK) {
            ResetSegment { tuple, seq: seg.ackno, ack: 0, flags: TcpFlags::RST }
        } else {
            let ack = seg
                .seqno
                .wrapping_add(seg.len())
                .wrapping_add(seg.flags.contains(TcpFlags::SYN) as u32);
            ResetSegment { tuple, seq: 0, ack, flags: TcpFlags::RST | TcpFlags::ACK }
        };
        debug!(
            "reset to {}:{} seq {} ack {} ({:?})",
            tuple.remote_addr, tuple.remote_port, rst.seq, rst.ack, reason
        );
        ctx.output.send_reset(&rst);
        ctx.stats.inc(TcpStat::SndRst);
        true
    }

    /// Reset a connection we are giving up on.
    pub fn reset_connection(tp: &TcpConnectionState, ctx: &mut WorkerContext) {
        let rst = ResetSegment {
            tuple: tp.tuple,
            seq: tp.rod.snd_nxt,
            ack: tp.rod.rcv_nxt,
            flags: TcpFlags::RST | TcpFlags::ACK,
        };
        ctx.output.send_reset(&rst);
        ctx.stats.inc(TcpStat::SndRst);
    }
}
