//! TCP Segment Reception (RX Path)
//!
//! `TcpRx::tcp_input` is the entry point for one received segment: it
//! validates the bytes, finds the connection and runs the segment through
//! the receive pipeline. The pipeline tries header prediction first; the
//! slow path then checks the segment against the receive window, lets
//! the control path and the ack engine react, queues the data and finally
//! decides whether an ack or output is due.
//!
//! Every stage returns a `Verdict`. An `Err` ends processing of the
//! segment and names what the dispatcher has to do with it.

use log::{debug, trace, warn};

use crate::ack_engine::AckEngine;
use crate::components::{sack_blkend, ReassInsert, SackFlags};
use crate::control_path::{ControlPath, SynSentNext};
use crate::error::ConnError;
use crate::fast_path::FastPath;
use crate::net_header::NetworkHeaderView;
use crate::options::{OptFlags, SackBlock};
use crate::paws::Paws;
use crate::recovery::Recovery;
use crate::seq::{seq_diff, seq_gt, seq_leq, seq_lt};
use crate::services::{ConnectionTable, Lookup, TimerId};
use crate::state::{ConnFlags, TcpConnectionState, TcpState};
use crate::stats::TcpStat;
use crate::tcp_out::TcpTx;
use crate::tcp_types::{FourTuple, InputAction, RstReason, SegmentCtx, TcpFlags, TcpSegment, Verdict};
use crate::validator::{ParsedSegment, SegmentValidator};
use crate::worker::WorkerContext;

/// What became of one received segment.
#[derive(Debug)]
pub enum InputOutcome {
    /// Consumed by a connection (acks and output already requested).
    Processed,
    Dropped,
    /// Dropped and answered with a reset.
    ResetSent,
    /// No connection, but a listener takes new connections on the port;
    /// the embedding stack hands the segment to its SYN handling.
    ToListener(ParsedSegment),
}

/// TCP RX Path
pub struct TcpRx;

impl TcpRx {
    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    /// Process one received TCP segment. `bytes` starts at the TCP header;
    /// `net` describes the network header it arrived with.
    pub fn tcp_input(
        table: &mut dyn ConnectionTable,
        ctx: &mut WorkerContext,
        net: &dyn NetworkHeaderView,
        bytes: &[u8],
    ) -> InputOutcome {
        ctx.stats.inc(TcpStat::RcvTotal);
        let ParsedSegment { tuple, mut seg } = match SegmentValidator::parse(ctx, net, bytes) {
            Ok(parsed) => parsed,
            Err(e) => {
                trace!("drop from {}: {}", net.src_addr(), e);
                return InputOutcome::Dropped;
            }
        };
        if SegmentValidator::reject_synfin(ctx, &seg) {
            ctx.stats.inc(TcpStat::BadSyn);
            return InputOutcome::Dropped;
        }

        let mut restarted = false;
        loop {
            let tp = match table.lookup(&tuple) {
                Lookup::Connection(tp) => tp,
                Lookup::Listener => return InputOutcome::ToListener(ParsedSegment { tuple, seg }),
                Lookup::NotFound => {
                    let action = SegmentValidator::closed_port(ctx, &tuple, &seg);
                    return Self::finish_unattached(ctx, net, &tuple, &seg, action);
                }
            };
            if let Err(action) = SegmentValidator::admit(tp, net) {
                return Self::finish_unattached(ctx, net, &tuple, &seg, action);
            }

            let action = Self::process_segment(tp, ctx, &mut seg);
            let outcome = match action {
                InputAction::Consumed => InputOutcome::Processed,
                InputAction::DropSilently => InputOutcome::Dropped,
                InputAction::DropWithAck => match TcpTx::drop_after_ack(tp, ctx, &seg) {
                    None => InputOutcome::Dropped,
                    Some(reason) => Self::reset_outcome(ctx, net, &tuple, &seg, reason),
                },
                InputAction::DropWithReset(reason) => {
                    Self::reset_outcome(ctx, net, &tuple, &seg, reason)
                }
                InputAction::RestartLookup => {
                    let id = tp.id;
                    table.detach(id);
                    if restarted {
                        return InputOutcome::Dropped;
                    }
                    restarted = true;
                    debug!("{}: recycled out of TIME_WAIT, looking up again", id);
                    continue;
                }
            };

            let (id, closed) = (tp.id, tp.state() == TcpState::Closed);
            if closed {
                table.detach(id);
            }
            return outcome;
        }
    }

    /// Run a batch of segments, then flush the acks aggregated along the
    /// way so each connection sends at most one.
    pub fn tcp_input_batch<'a, I>(
        table: &mut dyn ConnectionTable,
        ctx: &mut WorkerContext,
        segments: I,
    ) -> Vec<InputOutcome>
    where
        I: IntoIterator<Item = (&'a dyn NetworkHeaderView, &'a [u8])>,
    {
        let outcomes = segments
            .into_iter()
            .map(|(net, bytes)| Self::tcp_input(table, ctx, net, bytes))
            .collect();
        let flushed = ctx.flush_pending_output();
        if flushed > 0 {
            trace!("flushed {} aggregated acks", flushed);
        }
        outcomes
    }

    fn finish_unattached(
        ctx: &mut WorkerContext,
        net: &dyn NetworkHeaderView,
        tuple: &FourTuple,
        seg: &TcpSegment,
        action: InputAction,
    ) -> InputOutcome {
        match action {
            InputAction::DropWithReset(reason) => Self::reset_outcome(ctx, net, tuple, seg, reason),
            _ => InputOutcome::Dropped,
        }
    }

    fn reset_outcome(
        ctx: &mut WorkerContext,
        net: &dyn NetworkHeaderView,
        tuple: &FourTuple,
        seg: &TcpSegment,
        reason: RstReason,
    ) -> InputOutcome {
        if TcpTx::respond_reset(ctx, net, *tuple, seg, reason) {
            InputOutcome::ResetSent
        } else {
            InputOutcome::Dropped
        }
    }

    // ------------------------------------------------------------------------
    // Per-connection pipeline
    // ------------------------------------------------------------------------

    /// Run a validated segment through the receive pipeline of `tp`.
    ///
    /// `Consumed` means all acks and output were already requested; any
    /// other action is left to the caller.
    pub fn process_segment(
        tp: &mut TcpConnectionState,
        ctx: &mut WorkerContext,
        seg: &mut TcpSegment,
    ) -> InputAction {
        match Self::run(tp, ctx, seg) {
            Ok(()) => InputAction::Consumed,
            Err(action) => {
                trace!("{}: segment seq {} ends with {:?}", tp.id, seg.seqno, action);
                action
            }
        }
    }

    fn run(tp: &mut TcpConnectionState, ctx: &mut WorkerContext, seg: &mut TcpSegment) -> Verdict {
        let syn = seg.flags.contains(TcpFlags::SYN);
        let bare_syn = syn && !seg.flags.contains(TcpFlags::ACK);
        if let Some(keep) = tp.conn_mgmt.on_keep_activity(ctx.ticks, bare_syn, ctx.config.hz) {
            ctx.arm(tp.id, TimerId::Keep, keep);
        }

        let tiwin = tp.flow_ctrl.unscale(seg.wnd, syn);
        if tp.state() == TcpState::SynSent && syn {
            ControlPath::syn_options(tp, ctx, seg);
        }

        if FastPath::try_process(tp, ctx, seg, tiwin) {
            return Ok(());
        }

        Self::slow_path(tp, ctx, seg, tiwin)
    }

    fn slow_path(
        tp: &mut TcpConnectionState,
        ctx: &mut WorkerContext,
        seg: &mut TcpSegment,
        tiwin: u32,
    ) -> Verdict {
        let space = tp.rcvbuf.space_available();
        let (rcv_adv, rcv_nxt) = (tp.rod.rcv_adv, tp.rod.rcv_nxt);
        tp.flow_ctrl.compute_rcv_wnd(space, rcv_adv, rcv_nxt);
        tp.flow_ctrl.reset_autorcvbuf();

        let mut sc = SegmentCtx { tiwin, ..SegmentCtx::default() };

        match tp.state() {
            TcpState::Closed | TcpState::Listen => return Err(InputAction::DropSilently),
            TcpState::SynRcvd => {
                if seg.flags.contains(TcpFlags::ACK)
                    && (seq_leq(seg.ackno, tp.rod.snd_una) || seq_gt(seg.ackno, tp.rod.snd_max))
                {
                    return Err(InputAction::DropWithReset(RstReason::OpenPort));
                }
            }
            TcpState::SynSent => {
                return match ControlPath::syn_sent(tp, ctx, seg)? {
                    SynSentNext::ProcessAck => {
                        AckEngine::process_ack(tp, ctx, seg, &mut sc)?;
                        Self::step6(tp, ctx, seg, &mut sc)
                    }
                    SynSentNext::Step6 => Self::step6(tp, ctx, seg, &mut sc),
                };
            }
            _ => {}
        }

        if seg.flags.contains(TcpFlags::RST) {
            return ControlPath::process_rst(tp, ctx, seg);
        }

        Paws::check(tp, ctx, seg, tiwin)?;

        // A segment from before our SYN-ACK (or a LAND attack).
        if tp.state() == TcpState::SynRcvd && seq_lt(seg.seqno, tp.rod.irs) {
            return Err(InputAction::DropWithReset(RstReason::OpenPort));
        }

        Self::trim_leading(tp, ctx, seg);

        // The application is gone: new data can only be answered by a reset.
        if tp.conn_mgmt.no_fd_ref && tp.state() > TcpState::CloseWait && !seg.is_empty() {
            debug!("{}: data after close", tp.id);
            ControlPath::close(tp, ctx);
            ctx.stats.inc(TcpStat::RcvAfterClose);
            return Err(InputAction::DropWithReset(RstReason::Unlimited));
        }

        Self::trim_trailing(tp, ctx, seg)?;

        if seg.opts.has(OptFlags::TS) && tp.rod.ts_update_window(seg.seqno, seg.seq_end()) {
            tp.rod.record_ts(seg.opts.tsval, ctx.ticks);
        }

        // A SYN in the window is an error: the peer has lost the connection.
        if seg.flags.contains(TcpFlags::SYN) {
            ControlPath::drop(tp, ctx, ConnError::Reset);
            return Err(InputAction::DropWithReset(RstReason::Unlimited));
        }

        if !seg.flags.contains(TcpFlags::ACK) {
            if tp.state() == TcpState::SynRcvd || tp.conn_mgmt.has(ConnFlags::NEEDSYN) {
                return Self::step6(tp, ctx, seg, &mut sc);
            }
            return Err(InputAction::DropSilently);
        }

        if tp.state() == TcpState::SynRcvd {
            ControlPath::synrcvd_ack(tp, ctx, seg);
        }
        AckEngine::on_ack(tp, ctx, seg, &mut sc)?;
        Self::step6(tp, ctx, seg, &mut sc)
    }

    // ------------------------------------------------------------------------
    // Window trimming
    // ------------------------------------------------------------------------

    /// Drop whatever lies left of `rcv_nxt`. A segment made entirely of
    /// old data still moves on (it may carry a useful ack or RST) but gets
    /// an immediate ack to resynchronize the peer.
    fn trim_leading(tp: &mut TcpConnectionState, ctx: &mut WorkerContext, seg: &mut TcpSegment) {
        let todrop = seq_diff(tp.rod.rcv_nxt, seg.seqno);
        if todrop <= 0 {
            return;
        }
        let mut todrop = todrop as u32;
        let tlen = seg.len();

        if tp.do_sack() {
            // D-SACK the duplicate head.
            let mut end = sack_blkend(seg.seqno.wrapping_add(tlen), seg.flags.contains(TcpFlags::FIN));
            if seq_gt(end, tp.rod.rcv_nxt) {
                end = tp.rod.rcv_nxt;
            }
            tp.reass.reportblk = SackBlock::new(seg.seqno, end);
            tp.reass.sack_flags.insert(SackFlags::DUPSEG | SackFlags::SACKLEFT);
            tp.conn_mgmt.flags.insert(ConnFlags::ACKNOW);
        }

        if seg.flags.contains(TcpFlags::SYN) {
            seg.flags.remove(TcpFlags::SYN);
            seg.seqno = seg.seqno.wrapping_add(1);
            if seg.urp > 1 {
                seg.urp -= 1;
            } else {
                seg.flags.remove(TcpFlags::URG);
            }
            todrop -= 1;
        }

        if todrop > tlen || (todrop == tlen && !seg.flags.contains(TcpFlags::FIN)) {
            // Any valid FIN lies left of the window too.
            seg.flags.remove(TcpFlags::FIN);
            tp.conn_mgmt.flags.insert(ConnFlags::ACKNOW);
            todrop = tlen;
            ctx.stats.inc(TcpStat::RcvDupPack);
            ctx.stats.add(TcpStat::RcvDupByte, u64::from(todrop));
        } else {
            ctx.stats.inc(TcpStat::RcvPartDupPack);
            ctx.stats.add(TcpStat::RcvPartDupByte, u64::from(todrop));
        }
        if todrop > 0 {
            seg.trim_front(todrop);
        }
        trace!("{}: trimmed {} old bytes, seq now {}", tp.id, todrop, seg.seqno);
    }

    /// Drop whatever lies right of the receive window.
    fn trim_trailing(
        tp: &mut TcpConnectionState,
        ctx: &mut WorkerContext,
        seg: &mut TcpSegment,
    ) -> Verdict {
        let tlen = seg.len();
        let wnd_end = tp.rod.rcv_nxt.wrapping_add(tp.flow_ctrl.rcv_wnd);
        let todrop = seq_diff(seg.seqno.wrapping_add(tlen), wnd_end);
        if todrop <= 0 {
            return Ok(());
        }
        let todrop = todrop as u32;
        ctx.stats.inc(TcpStat::RcvPackAfterWin);

        if todrop >= tlen {
            ctx.stats.add(TcpStat::RcvByteAfterWin, u64::from(tlen));

            // A new connection request above the old sequence space may
            // replace a connection lingering in TIME_WAIT.
            if seg.flags.contains(TcpFlags::SYN)
                && tp.state() == TcpState::TimeWait
                && seq_gt(seg.seqno, tp.rod.rcv_nxt)
            {
                ControlPath::close(tp, ctx);
                return Err(InputAction::RestartLookup);
            }

            // A closed window only takes the probe at its edge, and that
            // one is acked at once; everything else is dropped with an ack.
            if tp.flow_ctrl.rcv_wnd == 0 && seg.seqno == tp.rod.rcv_nxt {
                tp.conn_mgmt.flags.insert(ConnFlags::ACKNOW);
                ctx.stats.inc(TcpStat::RcvWinProbe);
                debug!("{}: window probe at {}", tp.id, seg.seqno);
            } else {
                return Err(InputAction::DropWithAck);
            }
        } else {
            ctx.stats.add(TcpStat::RcvByteAfterWin, u64::from(todrop));
        }

        seg.trim_back(todrop);
        seg.flags.remove(TcpFlags::PSH | TcpFlags::FIN);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Window, urgent data, text and FIN
    // ------------------------------------------------------------------------

    fn step6(
        tp: &mut TcpConnectionState,
        ctx: &mut WorkerContext,
        seg: &mut TcpSegment,
        sc: &mut SegmentCtx,
    ) -> Verdict {
        // Only an ack makes the window field meaningful.
        if seg.flags.contains(TcpFlags::ACK)
            && tp.flow_ctrl.acceptable_window_update(seg.seqno, seg.ackno, sc.tiwin)
        {
            if tp.flow_ctrl.apply_window_update(seg.seqno, seg.ackno, sc.tiwin, seg.is_empty()) {
                ctx.stats.inc(TcpStat::RcvWinUpd);
            }
            sc.needoutput = true;
        }

        Self::update_rcv_up(tp, seg);

        let fin = Self::queue_text(tp, ctx, seg);
        if fin {
            ControlPath::process_fin(tp, ctx);
        }

        if sc.delayed_dupack && Recovery::recv_dupack(tp, ctx, seg.ackno, &seg.opts) {
            sc.needoutput = false;
        }

        if tp.conn_mgmt.has(ConnFlags::ACKNOW) || (sc.needoutput && tp.reass.report_needed()) {
            ctx.forget_pending(tp.id);
            TcpTx::output(tp, ctx, sc.needoutput);
        } else if sc.needoutput {
            TcpTx::output_unless_pending(tp, ctx);
        }
        tp.reass.report_cleanup();
        Ok(())
    }

    fn update_rcv_up(tp: &mut TcpConnectionState, seg: &TcpSegment) {
        if seg.flags.contains(TcpFlags::URG) && seg.urp > 0 && !tp.state().have_rcvd_fin() {
            let up = seg.seqno.wrapping_add(u32::from(seg.urp));
            if seq_gt(up, tp.rod.rcv_up) {
                tp.rod.rcv_up = up;
            }
        } else if seq_gt(tp.rod.rcv_nxt, tp.rod.rcv_up) {
            // Pull the urgent pointer along with the window.
            tp.rod.rcv_up = tp.rod.rcv_nxt;
        }
    }

    /// Queue the segment's text. Returns whether the FIN that ends the
    /// stream has now been reached in sequence.
    fn queue_text(tp: &mut TcpConnectionState, ctx: &mut WorkerContext, seg: &mut TcpSegment) -> bool {
        let tlen = seg.len();
        let has_fin = seg.flags.contains(TcpFlags::FIN);
        if (tlen == 0 && !has_fin) || tp.state().have_rcvd_fin() {
            return false;
        }
        if has_fin {
            tp.conn_mgmt.flags.insert(ConnFlags::SAWFIN);
        }

        // The next expected segment on an empty queue goes straight to the
        // socket. It may be acked late; anything out of order is acked at
        // once so the peer's fast retransmit can work.
        if seg.seqno == tp.rod.rcv_nxt && tp.reass.is_empty() && tp.state().have_established() {
            if has_fin {
                tp.conn_mgmt.flags.insert(ConnFlags::QUEDFIN);
            }
            if TcpTx::delay_ack(tp, ctx) {
                TcpTx::schedule_delack(tp, ctx);
            } else {
                tp.conn_mgmt.flags.insert(ConnFlags::ACKNOW);
            }
            tp.rod.advance_rcv_nxt(tlen);
            ctx.stats.inc(TcpStat::RcvPack);
            ctx.stats.add(TcpStat::RcvByte, u64::from(tlen));
            if tlen > 0 && !tp.rcvbuf.cant_receive_more() {
                if let Err(e) = tp.rcvbuf.append(core::mem::take(&mut seg.payload)) {
                    warn!("{}: receive buffer refused {} bytes: {}", tp.id, tlen, e);
                }
            }
            return has_fin;
        }

        if !tp.reass.sack_flags.contains(SackFlags::DUPSEG) {
            tp.reass.reportblk =
                SackBlock::new(seg.seqno, sack_blkend(seg.seqno.wrapping_add(tlen), has_fin));
        }
        let fin = Self::reass(tp, ctx, seg);
        tp.conn_mgmt.flags.insert(ConnFlags::ACKNOW);
        fin
    }

    /// Put an out-of-order (or not yet deliverable) segment on the
    /// reassembly queue, then deliver whatever became contiguous.
    fn reass(tp: &mut TcpConnectionState, ctx: &mut WorkerContext, seg: &mut TcpSegment) -> bool {
        let tlen = seg.len();
        if seg.seqno != tp.rod.rcv_nxt
            && ctx.reass_segments() + 1 >= ctx.config.reass_max_segments
        {
            ctx.stats.inc(TcpStat::RcvMemDrop);
            tp.reass.drop_report();
            warn!(
                "{}: reassembly limit {} reached, dropped {} bytes at {}",
                tp.id, ctx.config.reass_max_segments, tlen, seg.seqno
            );
            return false;
        }

        if seg.flags.contains(TcpFlags::FIN) {
            tp.conn_mgmt.flags.insert(ConnFlags::QUEDFIN);
        }
        let before = tp.reass.len();
        let payload = core::mem::take(&mut seg.payload);
        match tp.reass.insert(seg.seqno, payload, seg.flags.contains(TcpFlags::FIN)) {
            ReassInsert::Duplicate { bytes } => {
                ctx.stats.inc(TcpStat::RcvDupPack);
                ctx.stats.add(TcpStat::RcvDupByte, u64::from(bytes));
            }
            ReassInsert::Queued { bytes } => {
                ctx.stats.inc(TcpStat::RcvOoPack);
                ctx.stats.add(TcpStat::RcvOoByte, u64::from(bytes));
            }
        }
        let after = tp.reass.len();
        if after > before {
            ctx.reass_charge(after - before);
        } else {
            ctx.reass_release(before - after);
        }

        Self::present(tp, ctx)
    }

    /// Deliver the head of the reassembly queue if it has become
    /// contiguous with `rcv_nxt`. Returns whether a FIN was delivered.
    pub fn present(tp: &mut TcpConnectionState, ctx: &mut WorkerContext) -> bool {
        if !tp.state().have_established() {
            return false;
        }
        let mut fin = false;
        while let Some(entry) = tp.reass.present(tp.rod.rcv_nxt) {
            ctx.reass_release(1);
            let len = entry.len();
            tp.rod.advance_rcv_nxt(len);
            fin = entry.fin;
            if len > 0 && !tp.rcvbuf.cant_receive_more() {
                if let Err(e) = tp.rcvbuf.append(entry.data) {
                    warn!("{}: receive buffer refused {} bytes: {}", tp.id, len, e);
                }
            }
            trace!("{}: delivered {} queued bytes, rcv_nxt {}", tp.id, len, tp.rod.rcv_nxt);
        }
        fin
    }
}

