//! TCP Protocol Definitions
//!
//! Wire layout of the TCP header, flag bits, option kinds and the protocol
//! limits the input engine enforces.

use crate::error::SegmentError;

/// TCP header length (excluding options)
pub const TCP_HLEN: usize = 20;

/// TCP header flags
pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_ACK: u8 = 0x10;
pub const TCP_URG: u8 = 0x20;
pub const TCP_FLAGS: u8 = 0x3F;

/// Maximum TCP option bytes
pub const TCP_MAX_OPTION_BYTES: usize = 40;

/// Option kinds
pub const TCPOPT_EOL: u8 = 0;
pub const TCPOPT_NOP: u8 = 1;
pub const TCPOPT_MAXSEG: u8 = 2;
pub const TCPOPT_WINDOW: u8 = 3;
pub const TCPOPT_SACK_PERMITTED: u8 = 4;
pub const TCPOPT_SACK: u8 = 5;
pub const TCPOPT_TIMESTAMP: u8 = 8;

/// Option lengths (kind and length bytes included)
pub const TCPOLEN_MAXSEG: usize = 4;
pub const TCPOLEN_WINDOW: usize = 3;
pub const TCPOLEN_SACK_PERMITTED: usize = 2;
pub const TCPOLEN_TIMESTAMP: usize = 10;
pub const TCPOLEN_SACK_BLOCK: usize = 8;

/// Largest unscaled window.
pub const TCP_MAXWIN: u32 = 65535;

/// Largest window shift a peer may request.
pub const TCP_MAX_WINSHIFT: u8 = 14;

/// Room a timestamp option takes out of every segment (with padding).
pub const TCPOLEN_TSTAMP_APPA: u16 = 12;

/// Smallest segment size ever used, whatever the peer offers.
pub const TCP_MINMSS: u16 = 64;

/// TCP Header Structure
///
/// Fields are in network byte order (big-endian).
#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct TcpHdr {
    pub src: u16,
    pub dest: u16,
    pub seqno: u32,
    pub ackno: u32,
    /// Upper 4 bits: data offset in 32-bit words. Lower 6 bits: flags.
    pub _hdrlen_rsvd_flags: u16,
    pub wnd: u16,
    pub chksum: u16,
    pub urgp: u16,
}

impl TcpHdr {
    /// Read the fixed header from the front of `bytes`.
    ///
    /// Only the 20-byte length is checked here; the data offset is checked
    /// against the full segment by the validator.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SegmentError> {
        if bytes.len() < TCP_HLEN {
            return Err(SegmentError::Truncated { len: bytes.len() });
        }
        let ne16 = |at: usize| u16::from_ne_bytes([bytes[at], bytes[at + 1]]);
        let ne32 = |at: usize| {
            u32::from_ne_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        Ok(Self {
            src: ne16(0),
            dest: ne16(2),
            seqno: ne32(4),
            ackno: ne32(8),
            _hdrlen_rsvd_flags: ne16(12),
            wnd: ne16(14),
            chksum: ne16(16),
            urgp: ne16(18),
        })
    }

    /// Serialize the fixed header in wire order.
    pub fn to_bytes(&self) -> [u8; TCP_HLEN] {
        let mut out = [0u8; TCP_HLEN];
        let (src, dest, seqno, ackno) = (self.src, self.dest, self.seqno, self.ackno);
        let (hf, wnd, chksum, urgp) = (self._hdrlen_rsvd_flags, self.wnd, self.chksum, self.urgp);
        out[0..2].copy_from_slice(&src.to_ne_bytes());
        out[2..4].copy_from_slice(&dest.to_ne_bytes());
        out[4..8].copy_from_slice(&seqno.to_ne_bytes());
        out[8..12].copy_from_slice(&ackno.to_ne_bytes());
        out[12..14].copy_from_slice(&hf.to_ne_bytes());
        out[14..16].copy_from_slice(&wnd.to_ne_bytes());
        out[16..18].copy_from_slice(&chksum.to_ne_bytes());
        out[18..20].copy_from_slice(&urgp.to_ne_bytes());
        out
    }

    /// Build a header from host-order values.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        src_port: u16,
        dest_port: u16,
        seqno: u32,
        ackno: u32,
        hdrlen_words: u16,
        flags: u8,
        wnd: u16,
        urgp: u16,
    ) -> Self {
        let mut hdr = Self {
            src: src_port.to_be(),
            dest: dest_port.to_be(),
            seqno: seqno.to_be(),
            ackno: ackno.to_be(),
            _hdrlen_rsvd_flags: 0,
            wnd: wnd.to_be(),
            chksum: 0,
            urgp: urgp.to_be(),
        };
        hdr.set_hdrlen_flags(hdrlen_words, flags);
        hdr
    }

    /// Header length in 32-bit words
    #[inline]
    pub fn hdrlen(&self) -> u16 {
        u16::from_be(self._hdrlen_rsvd_flags) >> 12
    }

    /// Header length in bytes
    #[inline]
    pub fn hdrlen_bytes(&self) -> usize {
        (self.hdrlen() as usize) << 2
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        (u16::from_be(self._hdrlen_rsvd_flags) & TCP_FLAGS as u16) as u8
    }

    #[inline]
    pub fn set_hdrlen_flags(&mut self, len: u16, flags: u8) {
        self._hdrlen_rsvd_flags = u16::to_be((len << 12) | flags as u16);
    }

    #[inline]
    pub fn set_checksum(&mut self, sum: u16) {
        self.chksum = sum.to_be();
    }

    #[inline]
    pub fn src_port(&self) -> u16 {
        u16::from_be(self.src)
    }

    #[inline]
    pub fn dest_port(&self) -> u16 {
        u16::from_be(self.dest)
    }

    #[inline]
    pub fn sequence_number(&self) -> u32 {
        u32::from_be(self.seqno)
    }

    #[inline]
    pub fn ack_number(&self) -> u32 {
        u32::from_be(self.ackno)
    }

    #[inline]
    pub fn window(&self) -> u16 {
        u16::from_be(self.wnd)
    }

    #[inline]
    pub fn checksum(&self) -> u16 {
        u16::from_be(self.chksum)
    }

    #[inline]
    pub fn urgent_pointer(&self) -> u16 {
        u16::from_be(self.urgp)
    }
}

// Ensure the struct is exactly 20 bytes
const _: () = assert!(core::mem::size_of::<TcpHdr>() == TCP_HLEN);
