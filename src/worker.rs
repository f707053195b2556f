//! Worker Context
//!
//! Everything the engine mutates besides the connection itself lives in a
//! `WorkerContext`: the tick clock, the counters, the injected output and
//! timer services, the pending-output list and the reassembly budget. One
//! context exists per worker thread and connections are affine to it, so
//! nothing here is locked.

use std::sync::Arc;

use log::trace;

use crate::config::TcpConfig;
use crate::services::{OutputScheduler, TimerId, TimerService};
use crate::stats::{TcpStat, TcpStats};
use crate::tcp_types::{ConnId, RstReason};

/// Per-reason reset budget, refilled every second.
#[derive(Debug, Default, Clone, Copy)]
struct RstBucket {
    window_start: u32,
    sent: u32,
}

/// Per-worker engine state.
pub struct WorkerContext {
    pub config: Arc<TcpConfig>,
    /// Tick clock, advanced by the embedding stack.
    pub ticks: u32,
    pub stats: TcpStats,
    pub output: Box<dyn OutputScheduler>,
    pub timers: Box<dyn TimerService>,

    /// Connections owing an ack, flushed once per input batch.
    pending_output: Vec<ConnId>,
    /// Out-of-order segments held by all reassembly queues of this worker.
    reass_segments: usize,
    rst_buckets: [RstBucket; 2],
}

impl WorkerContext {
    pub fn new(
        config: Arc<TcpConfig>,
        output: Box<dyn OutputScheduler>,
        timers: Box<dyn TimerService>,
    ) -> Self {
        Self {
            config,
            ticks: 0,
            stats: TcpStats::default(),
            output,
            timers,
            pending_output: Vec::new(),
            reass_segments: 0,
            rst_buckets: [RstBucket::default(); 2],
        }
    }

    /// Advance the clock by `n` ticks.
    pub fn tick(&mut self, n: u32) {
        self.ticks = self.ticks.wrapping_add(n);
    }

    // ------------------------------------------------------------------------
    // Ack aggregation
    // ------------------------------------------------------------------------

    /// Queue `conn` for an ack after the current batch. Queuing twice is a
    /// no-op.
    pub fn queue_ack(&mut self, conn: ConnId) {
        if !self.pending_output.contains(&conn) {
            self.pending_output.push(conn);
        }
    }

    pub fn is_ack_queued(&self, conn: ConnId) -> bool {
        self.pending_output.contains(&conn)
    }

    /// Drop `conn` from the pending list (it already sent, or died).
    pub fn forget_pending(&mut self, conn: ConnId) {
        self.pending_output.retain(|c| *c != conn);
    }

    /// Issue every queued ack. Call once after a batch of input.
    pub fn flush_pending_output(&mut self) -> usize {
        let pending = core::mem::take(&mut self.pending_output);
        let n = pending.len();
        for conn in pending {
            trace!("{}: flushing aggregated ack", conn);
            self.output.request_output(conn);
        }
        n
    }

    // ------------------------------------------------------------------------
    // Reassembly budget
    // ------------------------------------------------------------------------

    pub fn reass_segments(&self) -> usize {
        self.reass_segments
    }

    pub fn reass_charge(&mut self, n: usize) {
        self.reass_segments += n;
    }

    pub fn reass_release(&mut self, n: usize) {
        self.reass_segments = self.reass_segments.saturating_sub(n);
    }

    // ------------------------------------------------------------------------
    // Timer shorthands
    // ------------------------------------------------------------------------

    pub fn arm(&mut self, conn: ConnId, timer: TimerId, ticks: u32) {
        self.timers.arm(conn, timer, ticks);
    }

    pub fn disarm(&mut self, conn: ConnId, timer: TimerId) {
        self.timers.disarm(conn, timer);
    }

    pub fn is_armed(&self, conn: ConnId, timer: TimerId) -> bool {
        self.timers.is_armed(conn, timer)
    }

    pub fn disarm_all(&mut self, conn: ConnId) {
        for t in TimerId::ALL {
            self.timers.disarm(conn, t);
        }
    }

    // ------------------------------------------------------------------------
    // Reset rate limiting
    // ------------------------------------------------------------------------

    /// Whether a reset of class `reason` may go out now. Resets of
    /// existing connections are never limited.
    pub fn rst_allowed(&mut self, reason: RstReason) -> bool {
        let idx = match reason {
            RstReason::Unlimited => return true,
            RstReason::ClosedPort => 0,
            RstReason::OpenPort => 1,
        };
        let (now, hz, limit) = (self.ticks, self.config.hz, self.config.rst_rate_limit);
        let bucket = &mut self.rst_buckets[idx];
        if now.wrapping_sub(bucket.window_start) >= hz {
            bucket.window_start = now;
            bucket.sent = 0;
        }
        if bucket.sent >= limit {
            self.stats.inc(TcpStat::RstRateLimited);
            return false;
        }
        bucket.sent += 1;
        true
    }
}
