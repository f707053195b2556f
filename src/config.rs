//! Engine Configuration
//!
//! Process-wide knobs. A `TcpConfig` is built once at startup, validated,
//! then shared read-only (behind an `Arc`) by every worker context.

use crate::error::ConfigError;
use crate::tcp_proto::{TCPOLEN_TSTAMP_APPA, TCP_MINMSS};

/// Default clock rate of the tick counter.
pub const DEFAULT_HZ: u32 = 1000;

/// Tunables of the input engine.
///
/// Times are expressed in ticks of the worker clock (`hz` ticks per second).
#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub hz: u32,

    /* Acknowledgment policy */
    pub delayed_ack: bool,
    pub delack_ticks: u32,
    /// Batch acks on the worker's pending-output list instead of sending
    /// one per in-order segment.
    pub aggregate_acks: bool,

    /* Loss recovery */
    pub rexmt_thresh: u32,
    pub sack: bool,
    pub rfc6675: bool,
    /// Enter recovery as soon as the scoreboard reports `snd_una` lost.
    pub rfc6675_rxt: bool,
    pub limited_transmit: bool,
    pub early_retransmit: bool,
    pub eifel_detect: bool,
    pub eifel_response: bool,
    pub eifel_rtoinc: u32,
    pub abc: bool,
    pub smart_sack: bool,
    pub force_sackrxt: u32,
    pub sack_maxburst: u32,
    pub aggressive_rescuesack: bool,
    pub ignore_redundant_dsack: bool,

    /* Receive side */
    pub paws_tolerance: u32,
    pub drop_synfin: bool,
    /// 0: reset closed ports; 1: drop SYNs to closed ports; 2: drop all.
    pub blackhole: u8,
    /// 0: silent; 1: log SYNs to closed ports; 2: log every segment.
    pub log_in_vain: u8,
    pub reass_max_segments: usize,
    pub autorcvbuf: bool,
    pub autorcvbuf_inc: usize,
    pub autorcvbuf_max: usize,

    /* Timers */
    pub rexmt_min: u32,
    pub rexmt_max: u32,
    pub rtobase3: u32,
    pub msl: u32,
    pub keep_idle: u32,
    pub max_idle: u32,

    /* Segment sizing */
    pub default_mss: u16,
    pub min_mss: u16,

    /// Resets emitted per second per reason.
    pub rst_rate_limit: u32,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self::with_hz(DEFAULT_HZ)
    }
}

impl TcpConfig {
    /// Defaults scaled to a clock of `hz` ticks per second.
    pub fn with_hz(hz: u32) -> Self {
        Self {
            hz,
            delayed_ack: true,
            delack_ticks: (hz / 10).max(1),
            aggregate_acks: true,
            rexmt_thresh: 3,
            sack: true,
            rfc6675: true,
            rfc6675_rxt: false,
            limited_transmit: true,
            early_retransmit: true,
            eifel_detect: true,
            eifel_response: true,
            eifel_rtoinc: 2,
            abc: true,
            smart_sack: true,
            force_sackrxt: 1,
            sack_maxburst: 4,
            aggressive_rescuesack: false,
            ignore_redundant_dsack: true,
            paws_tolerance: 25,
            drop_synfin: true,
            blackhole: 0,
            log_in_vain: 0,
            reass_max_segments: 4096,
            autorcvbuf: true,
            autorcvbuf_inc: 16 * 1024,
            autorcvbuf_max: 2 * 1024 * 1024,
            rexmt_min: (hz / 33).max(2),
            rexmt_max: 64 * hz,
            rtobase3: 3 * hz,
            msl: 30 * hz,
            keep_idle: 2 * 60 * 60 * hz,
            max_idle: 8 * 75 * hz,
            default_mss: 536,
            min_mss: 256,
            rst_rate_limit: 200,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hz == 0 {
            return Err(ConfigError::ZeroHz);
        }
        if self.rexmt_min > self.rexmt_max {
            return Err(ConfigError::RexmtRange { min: self.rexmt_min, max: self.rexmt_max });
        }
        if self.blackhole > 2 {
            return Err(ConfigError::Blackhole(self.blackhole));
        }
        if self.log_in_vain > 2 {
            return Err(ConfigError::LogInVain(self.log_in_vain));
        }
        if self.rexmt_thresh == 0 {
            return Err(ConfigError::RexmtThresh);
        }
        // Room for a timestamp option in the smallest segment.
        let mss_floor = TCP_MINMSS + TCPOLEN_TSTAMP_APPA;
        if self.default_mss < mss_floor {
            return Err(ConfigError::DefaultMss { mss: self.default_mss, floor: mss_floor });
        }
        if self.min_mss > self.default_mss {
            return Err(ConfigError::Mss { min: self.min_mss, default: self.default_mss });
        }
        if self.reass_max_segments < 2 {
            return Err(ConfigError::ReassCapacity(self.reass_max_segments));
        }
        Ok(())
    }

    /// Age after which `ts_recent` is considered stale (24 days).
    pub fn paws_idle(&self) -> u64 {
        24 * 24 * 60 * 60 * self.hz as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert_eq!(TcpConfig::default().validate(), Ok(()));
        assert_eq!(TcpConfig::with_hz(100).validate(), Ok(()));
    }

    #[test]
    fn test_rejects_bad_knobs() {
        let mut cfg = TcpConfig::default();
        cfg.blackhole = 3;
        assert_eq!(cfg.validate(), Err(ConfigError::Blackhole(3)));

        let mut cfg = TcpConfig::default();
        cfg.rexmt_min = cfg.rexmt_max + 1;
        assert!(matches!(cfg.validate(), Err(ConfigError::RexmtRange { .. })));

        let mut cfg = TcpConfig::default();
        cfg.reass_max_segments = 1;
        assert_eq!(cfg.validate(), Err(ConfigError::ReassCapacity(1)));
    }

    #[test]
    fn test_default_mss_floor() {
        let mut cfg = TcpConfig::default();
        cfg.min_mss = 0;
        cfg.default_mss = 75;
        assert_eq!(cfg.validate(), Err(ConfigError::DefaultMss { mss: 75, floor: 76 }));

        cfg.default_mss = 76;
        assert_eq!(cfg.validate(), Ok(()));
    }

    #[test]
    fn test_paws_idle_is_24_days() {
        let cfg = TcpConfig::with_hz(100);
        assert_eq!(cfg.paws_idle(), 24 * 86_400 * 100);
    }
}
