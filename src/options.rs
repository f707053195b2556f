//! TCP Option Parser
//!
//! Walks the option bytes of a segment once and produces a `TcpOptions`
//! value. Parsing never fails the segment: a malformed length simply ends
//! the walk, and options that are not valid in context are skipped.

use bitflags::bitflags;
use log::trace;

use crate::seq::{seq_geq, seq_leq, seq_lt, tstmp_gt};
use crate::tcp_proto::*;

bitflags! {
    /// Which options were present (and accepted) on a segment.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OptFlags: u16 {
        const MSS = 0x0001;
        const SCALE = 0x0002;
        const TS = 0x0004;
        const SACK_PERMITTED = 0x0008;
        const SACK = 0x0010;
        /// The first SACK block reports a duplicate.
        const DSACK = 0x0020;
        /// Every SACK block repeated information the scoreboard had.
        const SACK_REDUNDANT = 0x0040;
        /// A SACK option was present but rejected.
        const BAD_SACK = 0x0080;
    }
}

/// One SACK block, `[start, end)` in sequence space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SackBlock {
    pub start: u32,
    pub end: u32,
}

impl SackBlock {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }
}

/// Options carried by one segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TcpOptions {
    pub flags: OptFlags,
    pub mss: u16,
    pub requested_s_scale: u8,
    pub tsval: u32,
    /// Echoed timestamp; zero when absent or when it was ahead of our clock.
    pub tsecr: u32,
    pub sack_blocks: Vec<SackBlock>,
}

impl TcpOptions {
    /// Parse `bytes` (the header bytes past the fixed 20).
    ///
    /// `is_syn` gates MSS, window scale and SACK-permitted. `ack` is the
    /// segment's acknowledgment number, used to spot D-SACK blocks. `now`
    /// is the local timestamp clock.
    pub fn parse(bytes: &[u8], is_syn: bool, ack: u32, now: u32) -> Self {
        let mut to = TcpOptions::default();
        let mut cp = bytes;

        while let Some(&opt) = cp.first() {
            if opt == TCPOPT_EOL {
                break;
            }
            let optlen = if opt == TCPOPT_NOP {
                1
            } else {
                if cp.len() < 2 {
                    break;
                }
                let optlen = cp[1] as usize;
                if optlen < 2 || optlen > cp.len() {
                    trace!("option kind {} with bad length {}, stop", opt, optlen);
                    break;
                }
                optlen
            };
            let body = &cp[..optlen];

            match opt {
                TCPOPT_MAXSEG if optlen == TCPOLEN_MAXSEG && is_syn => {
                    to.flags |= OptFlags::MSS;
                    to.mss = u16::from_be_bytes([body[2], body[3]]);
                }
                TCPOPT_WINDOW if optlen == TCPOLEN_WINDOW && is_syn => {
                    to.flags |= OptFlags::SCALE;
                    to.requested_s_scale = body[2].min(TCP_MAX_WINSHIFT);
                }
                TCPOPT_TIMESTAMP if optlen == TCPOLEN_TIMESTAMP => {
                    to.flags |= OptFlags::TS;
                    to.tsval = u32::from_be_bytes([body[2], body[3], body[4], body[5]]);
                    to.tsecr = u32::from_be_bytes([body[6], body[7], body[8], body[9]]);
                    // An echo from the future cannot yield a sane RTT.
                    if to.tsecr != 0 && tstmp_gt(to.tsecr, now) {
                        to.tsecr = 0;
                    }
                }
                TCPOPT_SACK_PERMITTED if optlen == TCPOLEN_SACK_PERMITTED && is_syn => {
                    to.flags |= OptFlags::SACK_PERMITTED;
                }
                TCPOPT_SACK if (optlen - 2) % TCPOLEN_SACK_BLOCK == 0 => {
                    to.parse_sack(&body[2..], ack);
                }
                _ => {}
            }
            cp = &cp[optlen..];
        }
        to
    }

    fn parse_sack(&mut self, raw: &[u8], ack: u32) {
        let mut blocks = Vec::with_capacity(raw.len() / TCPOLEN_SACK_BLOCK);
        for chunk in raw.chunks_exact(TCPOLEN_SACK_BLOCK) {
            let start = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let end = u32::from_be_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
            if seq_leq(end, start) {
                // One bad block poisons the whole option.
                trace!("invalid SACK block [{}, {}), option discarded", start, end);
                self.flags.remove(OptFlags::SACK | OptFlags::DSACK);
                self.flags.insert(OptFlags::BAD_SACK);
                self.sack_blocks.clear();
                return;
            }
            blocks.push(SackBlock::new(start, end));
        }
        self.flags.insert(OptFlags::SACK);
        if is_dsack(&blocks, ack) {
            self.flags.insert(OptFlags::DSACK);
        }
        self.sack_blocks = blocks;
    }

    #[inline]
    pub fn has(&self, f: OptFlags) -> bool {
        self.flags.contains(f)
    }
}

/// RFC 2883: the first block is a D-SACK when it lies below the cumulative
/// ack or inside the second block.
fn is_dsack(blocks: &[SackBlock], ack: u32) -> bool {
    let Some(first) = blocks.first() else {
        return false;
    };
    if seq_lt(first.start, ack) {
        return true;
    }
    match blocks.get(1) {
        Some(second) => seq_geq(first.start, second.start) && seq_leq(first.end, second.end),
        None => false,
    }
}

/// Encode options for building segments in tests and responses.
pub fn encode_sack(blocks: &[SackBlock]) -> Vec<u8> {
    let mut out = vec![TCPOPT_NOP, TCPOPT_NOP, TCPOPT_SACK, (2 + blocks.len() * 8) as u8];
    for b in blocks {
        out.extend_from_slice(&b.start.to_be_bytes());
        out.extend_from_slice(&b.end.to_be_bytes());
    }
    out
}

/// NOP NOP TIMESTAMP, the 12-byte layout most stacks send.
pub fn encode_timestamp(tsval: u32, tsecr: u32) -> Vec<u8> {
    let mut out = vec![TCPOPT_NOP, TCPOPT_NOP, TCPOPT_TIMESTAMP, TCPOLEN_TIMESTAMP as u8];
    out.extend_from_slice(&tsval.to_be_bytes());
    out.extend_from_slice(&tsecr.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_syn_options() {
        let bytes = [
            TCPOPT_MAXSEG, 4, 0x05, 0xb4, // MSS 1460
            TCPOPT_NOP,
            TCPOPT_WINDOW, 3, 20, // scale 20 -> clipped
            TCPOPT_SACK_PERMITTED, 2,
        ];
        let to = TcpOptions::parse(&bytes, true, 0, 0);
        assert!(to.has(OptFlags::MSS | OptFlags::SCALE | OptFlags::SACK_PERMITTED));
        assert_eq!(to.mss, 1460);
        assert_eq!(to.requested_s_scale, TCP_MAX_WINSHIFT);
    }

    #[test]
    fn test_syn_only_options_ignored_otherwise() {
        let bytes = [TCPOPT_MAXSEG, 4, 0x05, 0xb4, TCPOPT_SACK_PERMITTED, 2];
        let to = TcpOptions::parse(&bytes, false, 0, 0);
        assert_eq!(to.flags, OptFlags::empty());
    }

    #[test]
    fn test_timestamp_from_future_echo_is_zeroed() {
        let to = TcpOptions::parse(&encode_timestamp(7, 5000), false, 0, 1000);
        assert!(to.has(OptFlags::TS));
        assert_eq!(to.tsval, 7);
        assert_eq!(to.tsecr, 0);

        let to = TcpOptions::parse(&encode_timestamp(7, 900), false, 0, 1000);
        assert_eq!(to.tsecr, 900);
    }

    #[test]
    fn test_bad_sack_block_discards_option() {
        let blocks = [SackBlock::new(100, 200), SackBlock::new(300, 300)];
        let to = TcpOptions::parse(&encode_sack(&blocks), false, 50, 0);
        assert!(!to.has(OptFlags::SACK));
        assert!(to.has(OptFlags::BAD_SACK));
        assert!(to.sack_blocks.is_empty());
    }

    #[test_case(&[SackBlock { start: 10, end: 20 }], 30 => true; "below cumulative ack")]
    #[test_case(&[SackBlock { start: 40, end: 50 }, SackBlock { start: 30, end: 60 }], 30 => true; "inside second block")]
    #[test_case(&[SackBlock { start: 40, end: 50 }, SackBlock { start: 60, end: 70 }], 30 => false; "plain sack")]
    fn test_dsack_detection(blocks: &[SackBlock], ack: u32) -> bool {
        TcpOptions::parse(&encode_sack(blocks), false, ack, 0).has(OptFlags::DSACK)
    }

    #[test]
    fn test_malformed_length_stops_without_failing() {
        // Timestamp first, then a kind with a length running past the end.
        let mut bytes = encode_timestamp(1, 0);
        bytes.extend_from_slice(&[TCPOPT_MAXSEG, 9, 0]);
        let to = TcpOptions::parse(&bytes, true, 0, 0);
        assert!(to.has(OptFlags::TS));
        assert!(!to.has(OptFlags::MSS));
    }

    #[test]
    fn test_unknown_kind_skipped_by_length() {
        let bytes = [30, 4, 0xff, 0xff, TCPOPT_SACK_PERMITTED, 2, TCPOPT_EOL, TCPOPT_WINDOW];
        let to = TcpOptions::parse(&bytes, true, 0, 0);
        assert_eq!(to.flags, OptFlags::SACK_PERMITTED);
    }
}
