//! TCP Common Types
//!
//! Shared types used across the input engine: the parsed segment, header
//! flags, connection identity and the per-segment verdict.

use core::fmt;
use std::net::IpAddr;

use bitflags::bitflags;

use crate::options::TcpOptions;
use crate::tcp_proto;

bitflags! {
    /// TCP Flags from the header
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TcpFlags: u8 {
        const FIN = tcp_proto::TCP_FIN;
        const SYN = tcp_proto::TCP_SYN;
        const RST = tcp_proto::TCP_RST;
        const PSH = tcp_proto::TCP_PSH;
        const ACK = tcp_proto::TCP_ACK;
        const URG = tcp_proto::TCP_URG;
    }
}

impl TcpFlags {
    pub fn from_tcphdr(flags: u8) -> Self {
        Self::from_bits_truncate(flags)
    }

    /// The flags that header prediction and the PAWS tolerance inspect.
    pub fn control(self) -> Self {
        self & (Self::SYN | Self::FIN | Self::RST | Self::URG | Self::ACK)
    }
}

/// Identity of a connection control block, assigned by its creator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Connection 4-tuple as seen from the local end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourTuple {
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
}

/// Parsed TCP segment information
///
/// The payload is owned by the segment until it is handed to the
/// reassembly queue or the socket buffer.
#[derive(Debug, Clone)]
pub struct TcpSegment {
    pub seqno: u32,
    pub ackno: u32,
    pub flags: TcpFlags,
    pub wnd: u16,
    pub urp: u16,
    pub opts: TcpOptions,
    pub payload: Vec<u8>,
}

impl TcpSegment {
    /// Payload length in bytes.
    #[inline]
    pub fn len(&self) -> u32 {
        self.payload.len() as u32
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Sequence number just past the data, SYN and FIN of this segment.
    pub fn seq_end(&self) -> u32 {
        self.seqno
            .wrapping_add(self.len())
            .wrapping_add(self.flags.contains(TcpFlags::SYN) as u32)
            .wrapping_add(self.flags.contains(TcpFlags::FIN) as u32)
    }

    /// Drop `n` bytes from the front of the payload, advancing the
    /// sequence number and the urgent pointer with it.
    pub fn trim_front(&mut self, n: u32) {
        let n = n.min(self.len());
        self.payload.drain(..n as usize);
        self.seqno = self.seqno.wrapping_add(n);
        if u32::from(self.urp) > n {
            self.urp -= n as u16;
        } else {
            self.flags.remove(TcpFlags::URG);
            self.urp = 0;
        }
    }

    /// Drop `n` bytes from the end of the payload.
    pub fn trim_back(&mut self, n: u32) {
        let keep = self.len().saturating_sub(n);
        self.payload.truncate(keep as usize);
    }
}

/// Rate-limit class of a generated reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RstReason {
    /// Segment for a port nobody listens on.
    ClosedPort,
    /// Bad segment for an open port (handshake or embryonic state).
    OpenPort,
    /// Reset of an existing connection; never rate limited.
    Unlimited,
}

/// Action to take after processing input
///
/// Returned by the per-segment processing and consumed by the dispatcher in
/// `tcp_in`, which turns it into output requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputAction {
    /// The segment was fully processed; output requests already issued.
    Consumed,
    DropSilently,
    /// Drop the segment but acknowledge it so the peer resynchronizes.
    DropWithAck,
    DropWithReset(RstReason),
    /// The connection was recycled out of TIME_WAIT; look the segment up
    /// again so a listener can take it.
    RestartLookup,
}

/// Result of one pipeline stage: `Ok` continues, `Err` ends processing of
/// the segment with the given action.
pub type Verdict<T = ()> = Result<T, InputAction>;

/// Decisions accumulated while one segment moves through the slow path.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentCtx {
    /// Advertised window in bytes (scaled unless on a SYN).
    pub tiwin: u32,
    /// Run the full output routine once processing is done.
    pub needoutput: bool,
    /// A duplicate ack whose processing waits until the data is queued.
    pub delayed_dupack: bool,
    /// The ack covered our FIN.
    pub ourfinisacked: bool,
}
