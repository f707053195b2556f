//! Header-Prediction Fast Path
//!
//! Most segments on a busy connection are either a pure ack for data we
//! sent or the next in-order data with nothing else going on. Both are
//! handled here without the general machinery; anything else falls
//! through untouched.

use log::{trace, warn};

use crate::ack_engine::AckEngine;
use crate::options::OptFlags;
use crate::seq::{seq_gt, seq_leq, tstmp_geq};
use crate::state::{ConnFlags, TcpConnectionState, TcpState};
use crate::stats::TcpStat;
use crate::tcp_out::TcpTx;
use crate::tcp_proto::TCP_MAXWIN;
use crate::tcp_types::{TcpFlags, TcpSegment};
use crate::worker::WorkerContext;

/// Header Prediction
pub struct FastPath;

impl FastPath {
    /// Try the two predicted shapes. Returns true when the segment was
    /// consumed; false leaves `tp` exactly as it was.
    pub fn try_process(
        tp: &mut TcpConnectionState,
        ctx: &mut WorkerContext,
        seg: &mut TcpSegment,
        tiwin: u32,
    ) -> bool {
        let opts = &seg.opts;
        let predictable = tp.state() == TcpState::Established
            && seg.flags.control() == TcpFlags::ACK
            && !tp.conn_mgmt.flags.intersects(ConnFlags::NEEDSYN | ConnFlags::NEEDFIN)
            && (!opts.has(OptFlags::TS) || tstmp_geq(opts.tsval, tp.rod.ts_recent))
            && seg.seqno == tp.rod.rcv_nxt
            && tp.rod.snd_nxt == tp.rod.snd_max;
        if !predictable {
            return false;
        }

        if seg.is_empty() {
            if seq_gt(seg.ackno, tp.rod.snd_una)
                && seq_leq(seg.ackno, tp.rod.snd_max)
                && tp.cong_ctrl.cwnd >= tp.flow_ctrl.snd_wnd
                && !tp.in_fast_recovery()
            {
                Self::record_ts(tp, ctx, seg);
                Self::predicted_ack(tp, ctx, seg, tiwin);
                return true;
            }
        } else if tiwin == tp.flow_ctrl.snd_wnd
            && seg.ackno == tp.rod.snd_una
            && tp.reass.is_empty()
            && seg.payload.len() <= tp.rcvbuf.space_available()
        {
            Self::record_ts(tp, ctx, seg);
            Self::predicted_data(tp, ctx, seg);
            return true;
        }
        false
    }

    /// The ack we last sent falls inside this segment: its timestamp is
    /// the one to echo.
    fn record_ts(tp: &mut TcpConnectionState, ctx: &WorkerContext, seg: &TcpSegment) {
        if seg.opts.has(OptFlags::TS) && seq_leq(seg.seqno, tp.rod.last_ack_sent) {
            tp.rod.record_ts(seg.opts.tsval, ctx.ticks);
        }
    }

    /// Pure ack for outstanding data.
    fn predicted_ack(tp: &mut TcpConnectionState, ctx: &mut WorkerContext, seg: &TcpSegment, tiwin: u32) {
        let ack = seg.ackno;
        let acked = ack.wrapping_sub(tp.rod.snd_una);
        ctx.stats.inc(TcpStat::PredAck);

        AckEngine::detect_spurious(tp, ctx, &seg.opts, acked);
        tp.cong_ctrl.clear_rxt_flags();
        AckEngine::sample_rtt(tp, ctx, &seg.opts, ack);

        ctx.stats.inc(TcpStat::RcvAckPack);
        ctx.stats.add(TcpStat::RcvAckByte, u64::from(acked));
        tp.rod.drop_acked(acked);
        tp.cong_ctrl.recover = ack.wrapping_sub(1);
        tp.rod.snd_una = ack;
        tp.cong_ctrl.dupacks = 0;
        let (maxseg, max_cwnd) = (tp.maxseg(), tp.flow_ctrl.max_cwnd());
        tp.cong_ctrl.grow(acked, maxseg, ctx.config.abc, false, max_cwnd);

        if tiwin != tp.flow_ctrl.snd_wnd
            && tp.flow_ctrl.acceptable_window_update(seg.seqno, ack, tiwin)
            && tp.flow_ctrl.apply_window_update(seg.seqno, ack, tiwin, true)
        {
            ctx.stats.inc(TcpStat::RcvWinUpd);
        }

        AckEngine::rearm_rexmt(tp, ctx, ack);
        trace!("{}: predicted ack {} (+{}), cwnd {}", tp.id, ack, acked, tp.cong_ctrl.cwnd);

        if tp.rod.snd_cc > 0 {
            TcpTx::output_unless_pending(tp, ctx);
        }
    }

    /// Next in-order data, nothing queued, room in the buffer.
    fn predicted_data(tp: &mut TcpConnectionState, ctx: &mut WorkerContext, seg: &mut TcpSegment) {
        let tlen = seg.len();
        ctx.stats.inc(TcpStat::PredDat);
        tp.rod.advance_rcv_nxt(tlen);
        ctx.stats.inc(TcpStat::RcvPack);
        ctx.stats.add(TcpStat::RcvByte, u64::from(tlen));

        Self::autosize_rcvbuf(tp, ctx, seg.opts.tsecr, tlen as usize);

        if !tp.rcvbuf.cant_receive_more() {
            if let Err(e) = tp.rcvbuf.append(core::mem::take(&mut seg.payload)) {
                warn!("{}: receive buffer refused {} bytes: {}", tp.id, tlen, e);
            }
        }

        if TcpTx::delay_ack(tp, ctx) {
            TcpTx::schedule_delack(tp, ctx);
        } else if ctx.config.aggregate_acks {
            tp.conn_mgmt.flags.insert(ConnFlags::ACKNOW);
            TcpTx::queue_ack(tp, ctx);
        } else {
            tp.conn_mgmt.flags.insert(ConnFlags::ACKNOW);
            TcpTx::output(tp, ctx, false);
        }
        trace!("{}: predicted data, rcv_nxt {}", tp.id, tp.rod.rcv_nxt);
    }

    /// Grow the receive buffer when the last RTT's worth of data nearly
    /// filled it. Needs an RTT measure, so only with echoed timestamps.
    fn autosize_rcvbuf(tp: &mut TcpConnectionState, ctx: &WorkerContext, tsecr: u32, tlen: usize) {
        let cfg = &ctx.config;
        if !cfg.autorcvbuf || tsecr == 0 || !tp.rcvbuf.autosize() {
            return;
        }
        let hiwat = tp.rcvbuf.hiwat();
        let Some(newsize) = tp.flow_ctrl.autorcvbuf_step(
            tsecr,
            tlen,
            cfg.hz,
            hiwat,
            cfg.autorcvbuf_inc,
            cfg.autorcvbuf_max,
        ) else {
            return;
        };
        tp.conn_mgmt.flags.insert(ConnFlags::RXRESIZED);
        if !tp.rcvbuf.reserve(newsize) {
            tp.rcvbuf.set_autosize(false);
        }
        // Past what the window field can ever advertise.
        if newsize >= (TCP_MAXWIN << tp.flow_ctrl.rcv_scale) as usize {
            tp.rcvbuf.set_autosize(false);
        }
        trace!("{}: receive buffer {} -> {}", tp.id, hiwat, newsize);
    }
}
