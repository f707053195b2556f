//! PAWS Guard
//!
//! RFC 1323 protection against wrapped sequence numbers: a segment whose
//! timestamp is older than the most recent one we accepted is a duplicate
//! from an earlier lap of the sequence space.

use log::trace;

use crate::options::OptFlags;
use crate::seq::{tstmp_geq, tstmp_lt};
use crate::state::{ConnFlags, TcpConnectionState, TcpState};
use crate::stats::TcpStat;
use crate::tcp_types::{InputAction, TcpFlags, TcpSegment, Verdict};
use crate::worker::WorkerContext;

/// PAWS Guard
pub struct Paws;

impl Paws {
    /// Reject a segment carrying a timestamp older than `ts_recent`.
    ///
    /// A `ts_recent` idle for more than 24 days is invalidated instead.
    /// Rejected data is acked (the peer may be probing), rejected empty
    /// segments vanish.
    pub fn check(
        tp: &mut TcpConnectionState,
        ctx: &mut WorkerContext,
        seg: &TcpSegment,
        tiwin: u32,
    ) -> Verdict {
        let opts = &seg.opts;
        if !opts.has(OptFlags::TS)
            || tp.rod.ts_recent == 0
            || !tstmp_lt(opts.tsval, tp.rod.ts_recent)
        {
            return Ok(());
        }

        let age = ctx.ticks.wrapping_sub(tp.rod.ts_recent_age) as i32;
        if i64::from(age) > ctx.config.paws_idle() as i64 {
            trace!("{}: ts_recent idle for {} ticks, invalidated", tp.id, age);
            tp.rod.ts_recent = 0;
            return Ok(());
        }

        if Self::tolerable(tp, ctx, seg, tiwin) {
            ctx.stats.inc(TcpStat::PawsAccept);
            return Ok(());
        }

        let tlen = seg.len();
        ctx.stats.inc(TcpStat::RcvDupPack);
        ctx.stats.add(TcpStat::RcvDupByte, u64::from(tlen));
        ctx.stats.inc(TcpStat::PawsDrop);
        trace!(
            "{}: PAWS drop tsval {} < ts_recent {}",
            tp.id, opts.tsval, tp.rod.ts_recent
        );
        if tlen > 0 {
            Err(InputAction::DropWithAck)
        } else {
            Err(InputAction::DropSilently)
        }
    }

    /// A fast retransmission carries a newer timestamp than the segments
    /// sent before it, so those may show up "old" yet be new data. Accept
    /// them when they are plain in-order (or queue-extending) data, change
    /// nothing on the send side, and are only slightly older.
    fn tolerable(tp: &TcpConnectionState, ctx: &WorkerContext, seg: &TcpSegment, tiwin: u32) -> bool {
        let tol = ctx.config.paws_tolerance;
        tol != 0
            && !seg.is_empty()
            && tp.state() == TcpState::Established
            && seg.flags.control() == TcpFlags::ACK
            && !tp.conn_mgmt.flags.intersects(ConnFlags::NEEDSYN | ConnFlags::NEEDFIN)
            && seg.ackno == tp.rod.snd_una
            && tiwin == tp.flow_ctrl.snd_wnd
            && tstmp_geq(seg.opts.tsval.wrapping_add(tol), tp.rod.ts_recent)
            && (seg.seqno == tp.rod.rcv_nxt || tp.reass.can_merge_last(seg.seqno, seg.len()))
    }
}
