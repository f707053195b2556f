//! TCP segment input engine
//!
//! Receive-side processing of TCP segments for a stack that owns its own
//! sockets, output path and connection table: validation, header
//! prediction, the RFC 793 state machine with RFC 1323 timestamps and
//! window scaling, SACK based loss recovery (RFC 6675), NewReno, limited
//! and early retransmit, Eifel spurious-retransmit undo and receive buffer
//! auto-sizing.
//!
//! The engine never transmits by itself. It records what has to happen in
//! the connection state and asks the injected collaborators (see
//! [`services`]) for acks, output, resets and timers. All per-thread state
//! lives in a [`WorkerContext`].

pub mod seq;
pub mod tcp_proto;
pub mod net_header;
pub mod options;
pub mod tcp_types;
pub mod error;
pub mod config;
pub mod stats;
pub mod services;
pub mod worker;
pub mod components;
pub mod state;

pub mod validator;
pub mod paws;
pub mod fast_path;
pub mod ack_engine;
pub mod recovery;
pub mod control_path;
pub mod tcp_in;
pub mod tcp_out;
pub mod timers;

pub use config::TcpConfig;
pub use control_path::ControlPath;
pub use error::{ConfigError, ConnError, RecvBufError, SegmentError};
pub use net_header::{Ipv4View, Ipv6View, NetworkHeaderView};
pub use services::{
    ConnectionTable, Lookup, OutputScheduler, RecvBufHandle, SackScoreboard, SocketRecvBuffer,
    TimerId, TimerService,
};
pub use state::{TcpConnectionState, TcpState};
pub use stats::{TcpStat, TcpStats};
pub use tcp_in::{InputOutcome, TcpRx};
pub use tcp_out::{ResetSegment, TcpTx};
pub use tcp_types::{ConnId, FourTuple, InputAction, RstReason, TcpFlags, TcpSegment};
pub use timers::TcpTimers;
pub use worker::WorkerContext;
