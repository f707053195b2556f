//! TCP Connection State
//!
//! The connection control block seen by the input engine, aggregating the
//! disjoint state components from the components module, plus the two
//! collaborators every connection carries: its socket receive buffer and its
//! SACK scoreboard.

pub use crate::components::{
    CongestionControlState, ConnFlags, ConnectionManagementState, FlowControlState,
    ReassemblyState, ReliableOrderedDeliveryState, RttState, RxtFlags, SackFlags,
};

use crate::config::TcpConfig;
use crate::services::{RecvBufHandle, SackScoreboard};
use crate::tcp_types::{ConnId, FourTuple};

/// TCP State Machine States
///
/// Ordered the way the state comparisons below rely on.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum TcpState {
    Closed = 0,
    Listen = 1,
    SynSent = 2,
    SynRcvd = 3,
    Established = 4,
    CloseWait = 5,
    FinWait1 = 6,
    Closing = 7,
    LastAck = 8,
    FinWait2 = 9,
    TimeWait = 10,
}

impl TcpState {
    pub fn from_u32(val: u32) -> Option<Self> {
        match val {
            0 => Some(TcpState::Closed),
            1 => Some(TcpState::Listen),
            2 => Some(TcpState::SynSent),
            3 => Some(TcpState::SynRcvd),
            4 => Some(TcpState::Established),
            5 => Some(TcpState::CloseWait),
            6 => Some(TcpState::FinWait1),
            7 => Some(TcpState::Closing),
            8 => Some(TcpState::LastAck),
            9 => Some(TcpState::FinWait2),
            10 => Some(TcpState::TimeWait),
            _ => None,
        }
    }

    /// The handshake completed at some point.
    pub fn have_established(self) -> bool {
        self >= TcpState::Established
    }

    /// The peer's FIN has been consumed.
    pub fn have_rcvd_fin(self) -> bool {
        matches!(
            self,
            TcpState::CloseWait | TcpState::Closing | TcpState::LastAck | TcpState::TimeWait
        )
    }

    /// We have closed our side: FIN_WAIT_1 and everything after it.
    pub fn is_closing(self) -> bool {
        self > TcpState::CloseWait
    }
}

/// Complete TCP Connection State
///
/// Aggregates the state components. Created by the accept/connect path,
/// mutated here and by the output path, destroyed by its owner after the
/// engine detaches it.
pub struct TcpConnectionState {
    pub id: ConnId,
    pub tuple: FourTuple,

    pub conn_mgmt: ConnectionManagementState,
    pub rod: ReliableOrderedDeliveryState,
    pub rtt: RttState,
    pub flow_ctrl: FlowControlState,
    pub cong_ctrl: CongestionControlState,
    pub reass: ReassemblyState,

    pub rcvbuf: RecvBufHandle,
    pub scoreboard: Box<dyn SackScoreboard>,
}

impl TcpConnectionState {
    pub fn new(
        id: ConnId,
        tuple: FourTuple,
        rcvbuf: RecvBufHandle,
        scoreboard: Box<dyn SackScoreboard>,
    ) -> Self {
        Self {
            id,
            tuple,
            conn_mgmt: ConnectionManagementState::new(),
            rod: ReliableOrderedDeliveryState::new(),
            rtt: RttState::new(),
            flow_ctrl: FlowControlState::new(),
            cong_ctrl: CongestionControlState::new(),
            reass: ReassemblyState::new(),
            rcvbuf,
            scoreboard,
        }
    }

    /// Take the per-connection defaults from `cfg`: retransmit bounds,
    /// keepalive times, the fast retransmit threshold and the segment size
    /// used until the peer's MSS is known.
    pub fn configure(&mut self, cfg: &TcpConfig) {
        self.rtt.rttmin = cfg.rexmt_min;
        self.rtt.rxtcur = cfg.rtobase3;
        self.conn_mgmt.keep_idle = cfg.keep_idle;
        self.conn_mgmt.max_idle = cfg.max_idle;
        self.conn_mgmt.maxseg = u32::from(cfg.default_mss);
        self.cong_ctrl.rxtthresh = cfg.rexmt_thresh;
    }

    #[inline]
    pub fn state(&self) -> TcpState {
        self.conn_mgmt.state
    }

    #[inline]
    pub fn maxseg(&self) -> u32 {
        self.conn_mgmt.maxseg
    }

    /// SACK is in use on this connection.
    #[inline]
    pub fn do_sack(&self) -> bool {
        self.conn_mgmt.flags.contains(ConnFlags::SACK_PERMITTED)
    }

    #[inline]
    pub fn in_fast_recovery(&self) -> bool {
        self.cong_ctrl.in_fast_recovery()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(!TcpState::SynRcvd.have_established());
        assert!(TcpState::Established.have_established());
        assert!(TcpState::TimeWait.have_established());

        assert!(TcpState::CloseWait.have_rcvd_fin());
        assert!(!TcpState::FinWait2.have_rcvd_fin());
        assert!(!TcpState::Established.have_rcvd_fin());

        assert!(!TcpState::CloseWait.is_closing());
        assert!(TcpState::FinWait1.is_closing());
        assert!(TcpState::FinWait2.is_closing());
    }

    #[test]
    fn test_from_u32_roundtrip() {
        for v in 0..=10 {
            assert_eq!(TcpState::from_u32(v).map(|s| s as u32), Some(v));
        }
        assert_eq!(TcpState::from_u32(11), None);
    }
}
