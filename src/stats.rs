//! Statistics Counters
//!
//! Counters are worker-local and unsynchronized; an aggregator may sum the
//! per-worker tables when reporting.

use core::fmt;

/// One protocol counter.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpStat {
    /* Receive validation */
    RcvTotal,
    RcvShort,
    RcvBadOff,
    RcvBadSum,
    NoPort,
    BadSyn,
    BlackholeDrop,
    RstRateLimited,

    /* Receive data */
    RcvPack,
    RcvByte,
    RcvDupPack,
    RcvDupByte,
    RcvPartDupPack,
    RcvPartDupByte,
    RcvOoPack,
    RcvOoByte,
    RcvPackAfterWin,
    RcvByteAfterWin,
    RcvAfterClose,
    RcvWinProbe,
    RcvMemDrop,
    PawsDrop,
    PawsAccept,
    PredAck,
    PredDat,

    /* Receive acks */
    RcvAckPack,
    RcvAckByte,
    RcvDupAck,
    RcvAckTooMuch,
    RcvWinUpd,
    RttUpdated,
    SackSbUpdate,
    BadSackOpt,
    DsackOpt,

    /* Recovery */
    SndFastRexmt,
    SndEarlyRexmt,
    SndLimited,
    SndSackPack,
    SndSackByte,
    SackRescue,
    EifelDetected,
    EifelResponse,
    RexmtBad,
    RexmtTimeo,

    /* Connections */
    Connects,
    Closed,
    Drops,
    ConnDrops,
    TimeoutDrop,
    KeepDrop,
    DelAck,
    SndRst,
}

impl TcpStat {
    pub const COUNT: usize = TcpStat::SndRst as usize + 1;
}

/// Worker-local counter table.
#[derive(Clone)]
pub struct TcpStats {
    counters: [u64; TcpStat::COUNT],
}

impl Default for TcpStats {
    fn default() -> Self {
        Self { counters: [0; TcpStat::COUNT] }
    }
}

impl TcpStats {
    #[inline]
    pub fn inc(&mut self, stat: TcpStat) {
        self.add(stat, 1);
    }

    #[inline]
    pub fn add(&mut self, stat: TcpStat, n: u64) {
        let c = &mut self.counters[stat as usize];
        *c = c.wrapping_add(n);
    }

    #[inline]
    pub fn get(&self, stat: TcpStat) -> u64 {
        self.counters[stat as usize]
    }

    /// Fold another worker's table into this one.
    pub fn merge(&mut self, other: &TcpStats) {
        for (a, b) in self.counters.iter_mut().zip(other.counters.iter()) {
            *a = a.wrapping_add(*b);
        }
    }
}

impl fmt::Debug for TcpStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only the non-zero counters, the full table is mostly noise.
        let mut m = f.debug_map();
        for i in 0..TcpStat::COUNT {
            if self.counters[i] != 0 {
                m.entry(&i, &self.counters[i]);
            }
        }
        m.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inc_add_merge() {
        let mut a = TcpStats::default();
        a.inc(TcpStat::RcvTotal);
        a.add(TcpStat::RcvByte, 100);
        let mut b = TcpStats::default();
        b.inc(TcpStat::RcvTotal);
        b.inc(TcpStat::SndRst);
        a.merge(&b);
        assert_eq!(a.get(TcpStat::RcvTotal), 2);
        assert_eq!(a.get(TcpStat::RcvByte), 100);
        assert_eq!(a.get(TcpStat::SndRst), 1);
        assert_eq!(a.get(TcpStat::PawsDrop), 0);
    }
}
