//! Connection Management Component
//!
//! This component owns the TCP state machine, the per-connection flags and
//! the lifecycle timestamps.

use bitflags::bitflags;
use log::debug;

use crate::state::TcpState;
use crate::tcp_types::ConnId;

bitflags! {
    /// Per-connection flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConnFlags: u32 {
        /// Ack immediately instead of delaying.
        const ACKNOW = 0x0000_0001;
        /// An ack is owed but may be delayed.
        const DELACK = 0x0000_0002;
        /// Half-synchronized: our SYN still has to be sent/acked.
        const NEEDSYN = 0x0000_0004;
        /// Close requested before the handshake completed.
        const NEEDFIN = 0x0000_0008;
        const SENTFIN = 0x0000_0010;
        /// Our last advertisement was a zero window.
        const RXWIN0SENT = 0x0000_0020;
        const REQ_SCALE = 0x0000_0040;
        const RCVD_SCALE = 0x0000_0080;
        const REQ_TSTMP = 0x0000_0100;
        const RCVD_TSTMP = 0x0000_0200;
        const SACK_PERMITTED = 0x0000_0400;
        /// A FIN has been seen (not necessarily accepted).
        const SAWFIN = 0x0000_0800;
        /// The peer's FIN sits in the reassembly queue or was delivered.
        const QUEDFIN = 0x0000_1000;
        /// Transmit now regardless of Nagle and silly-window avoidance.
        const XMITNOW = 0x0000_2000;
        /// The receive buffer grew; the next ack must not be skipped.
        const RXRESIZED = 0x0000_4000;
        const KEEPALIVE = 0x0000_8000;
        const NOOPT = 0x0001_0000;
    }
}

/// Connection Management State
///
/// Only the control path changes `state`; the receive pipeline reads it.
pub struct ConnectionManagementState {
    /* Lifecycle State */
    pub state: TcpState,
    pub flags: ConnFlags,

    /* Static Connection Parameters & Options */
    /// Payload bytes in a full-sized segment.
    pub maxseg: u32,
    /// Reject segments whose TTL/hop limit is below this.
    pub min_ttl: u8,
    /// The application closed its descriptor.
    pub no_fd_ref: bool,

    /* Timers & Keep-Alive (ticks) */
    pub rcvtime: u32,
    pub starttime: u32,
    pub keep_idle: u32,
    pub max_idle: u32,
}

impl ConnectionManagementState {
    pub fn new() -> Self {
        Self {
            state: TcpState::Closed,
            flags: ConnFlags::empty(),
            maxseg: 536,
            min_ttl: 0,
            no_fd_ref: false,
            rcvtime: 0,
            starttime: 0,
            keep_idle: 0,
            max_idle: 0,
        }
    }

    /// Move to `next`, logging the transition.
    pub fn set_state(&mut self, id: ConnId, next: TcpState) {
        if self.state != next {
            debug!("{}: {:?} -> {:?}", id, self.state, next);
            self.state = next;
        }
    }

    #[inline]
    pub fn has(&self, f: ConnFlags) -> bool {
        self.flags.contains(f)
    }

    /// Both ends asked for window scaling.
    pub fn scaling_agreed(&self) -> bool {
        self.flags.contains(ConnFlags::REQ_SCALE | ConnFlags::RCVD_SCALE)
    }

    /// Both ends use timestamps, so every segment loses room to them.
    pub fn timestamps_agreed(&self) -> bool {
        self.flags.contains(ConnFlags::REQ_TSTMP | ConnFlags::RCVD_TSTMP)
            && !self.flags.contains(ConnFlags::NOOPT)
    }

    // ------------------------------------------------------------------------
    // Keep-alive
    // ------------------------------------------------------------------------

    /// Note activity on an established connection. Returns the keepalive
    /// interval to re-arm with, or None when the state does not qualify.
    ///
    /// A bare SYN on a synchronized connection is suspicious (peer reboot),
    /// so it schedules a quick probe instead of refreshing the idle time.
    pub fn on_keep_activity(&mut self, now: u32, bare_syn: bool, hz: u32) -> Option<u32> {
        if !self.state.have_established() {
            return None;
        }
        if bare_syn {
            self.flags.insert(ConnFlags::KEEPALIVE);
            Some((hz / 2).max(1))
        } else {
            self.rcvtime = now;
            self.flags.remove(ConnFlags::KEEPALIVE);
            Some(self.keep_idle)
        }
    }
}

impl Default for ConnectionManagementState {
    fn default() -> Self {
        Self::new()
    }
}
