//! Segment Validator & Demultiplex Admission
//!
//! Turns raw TCP bytes into a `TcpSegment` after the wire-integrity checks,
//! and decides what happens to segments that found no connection or fail an
//! admission filter. Side effects are limited to statistics and logging.

use log::{info, trace};

use crate::error::SegmentError;
use crate::net_header::{verify_tcp_checksum, NetworkHeaderView};
use crate::options::{OptFlags, TcpOptions};
use crate::state::{TcpConnectionState, TcpState};
use crate::stats::TcpStat;
use crate::tcp_proto::{TcpHdr, TCP_HLEN};
use crate::tcp_types::{FourTuple, InputAction, RstReason, TcpFlags, TcpSegment};
use crate::worker::WorkerContext;

/// A segment that passed the wire checks, with the tuple it belongs to.
#[derive(Debug, Clone)]
pub struct ParsedSegment {
    pub tuple: FourTuple,
    pub seg: TcpSegment,
}

/// Segment Validator
pub struct SegmentValidator;

impl SegmentValidator {
    /// Verify and parse `bytes` (TCP header, options and payload).
    ///
    /// The checksum is verified over the pseudo header supplied by `net`
    /// before anything else is trusted. Options are parsed with the local
    /// clock `now` so a timestamp echo from the future can be discarded.
    pub fn parse(
        ctx: &mut WorkerContext,
        net: &dyn NetworkHeaderView,
        bytes: &[u8],
    ) -> Result<ParsedSegment, SegmentError> {
        let hdr = TcpHdr::from_bytes(bytes).map_err(|e| {
            ctx.stats.inc(TcpStat::RcvShort);
            e
        })?;

        if !verify_tcp_checksum(net, bytes) {
            ctx.stats.inc(TcpStat::RcvBadSum);
            return Err(SegmentError::BadChecksum);
        }

        let off = hdr.hdrlen_bytes();
        if off < TCP_HLEN || off > bytes.len() {
            ctx.stats.inc(TcpStat::RcvBadOff);
            return Err(SegmentError::BadDataOffset { offset: off, len: bytes.len() });
        }

        let flags = TcpFlags::from_tcphdr(hdr.flags());
        let ackno = hdr.ack_number();
        let opts = TcpOptions::parse(
            &bytes[TCP_HLEN..off],
            flags.contains(TcpFlags::SYN),
            ackno,
            ctx.ticks,
        );
        if opts.has(OptFlags::DSACK) {
            ctx.stats.inc(TcpStat::DsackOpt);
        }
        if opts.has(OptFlags::BAD_SACK) {
            ctx.stats.inc(TcpStat::BadSackOpt);
        }
        let seg = TcpSegment {
            seqno: hdr.sequence_number(),
            ackno,
            flags,
            wnd: hdr.window(),
            urp: hdr.urgent_pointer(),
            opts,
            payload: bytes[off..].to_vec(),
        };
        let tuple = FourTuple {
            local_addr: net.dst_addr(),
            local_port: hdr.dest_port(),
            remote_addr: net.src_addr(),
            remote_port: hdr.src_port(),
        };
        trace!(
            "rx {}:{} -> {}:{} seq {} ack {} {:?} len {}",
            tuple.remote_addr,
            tuple.remote_port,
            tuple.local_addr,
            tuple.local_port,
            seg.seqno,
            seg.ackno,
            seg.flags,
            seg.len()
        );
        Ok(ParsedSegment { tuple, seg })
    }

    /// SYN and FIN together is never legitimate; drop it when configured.
    pub fn reject_synfin(ctx: &WorkerContext, seg: &TcpSegment) -> bool {
        ctx.config.drop_synfin && seg.flags.contains(TcpFlags::SYN | TcpFlags::FIN)
    }

    /// Verdict for a segment that matched neither a connection nor a
    /// listener: optionally log the attempt, then either answer with a
    /// reset or drop according to the blackhole policy.
    pub fn closed_port(
        ctx: &mut WorkerContext,
        tuple: &FourTuple,
        seg: &TcpSegment,
    ) -> InputAction {
        ctx.stats.inc(TcpStat::NoPort);
        let syn = seg.flags.contains(TcpFlags::SYN);

        match ctx.config.log_in_vain {
            1 if syn => info!(
                "connection attempt to {}:{} from {}:{}",
                tuple.local_addr, tuple.local_port, tuple.remote_addr, tuple.remote_port
            ),
            2 => info!(
                "connection attempt to {}:{} from {}:{} flags {:?}",
                tuple.local_addr, tuple.local_port, tuple.remote_addr, tuple.remote_port,
                seg.flags
            ),
            _ => {}
        }

        let blackholed = match ctx.config.blackhole {
            1 => syn,
            2 => true,
            _ => false,
        };
        if blackholed {
            ctx.stats.inc(TcpStat::BlackholeDrop);
            return InputAction::DropSilently;
        }
        InputAction::DropWithReset(RstReason::ClosedPort)
    }

    /// Per-connection admission filters applied after lookup.
    pub fn admit(tp: &TcpConnectionState, net: &dyn NetworkHeaderView) -> Result<(), InputAction> {
        if net.hop_limit() < tp.conn_mgmt.min_ttl {
            trace!("{}: hop limit {} below {}", tp.id, net.hop_limit(), tp.conn_mgmt.min_ttl);
            return Err(InputAction::DropSilently);
        }
        if tp.state() == TcpState::Closed {
            return Err(InputAction::DropSilently);
        }
        Ok(())
    }
}
