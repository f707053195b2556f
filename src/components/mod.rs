//! TCP State Components
//!
//! The connection control block is split into disjoint components:
//! 1. Connection Management - state machine, flags and lifecycle times
//! 2. Reliable Ordered Delivery - sequence numbers and timestamps
//! 3. RTT Estimation - smoothed RTT and the retransmit timeout
//! 4. Flow Control - send and receive windows
//! 5. Congestion Control - cwnd, recovery and the Eifel snapshot
//! 6. Reassembly - the out-of-order queue and SACK report blocks

mod connection_mgmt;
mod rod;
mod rtt;
mod flow_control;
mod congestion_control;
mod reassembly;

pub use connection_mgmt::{ConnFlags, ConnectionManagementState};
pub use rod::ReliableOrderedDeliveryState;
pub use rtt::{RttState, TCP_MAXRXTSHIFT};
pub use flow_control::FlowControlState;
pub use congestion_control::{initial_window, CongestionControlState, RxtFlags};
pub use reassembly::{sack_blkend, ReassEntry, ReassInsert, ReassemblyState, SackFlags};
