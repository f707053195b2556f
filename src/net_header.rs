//! Network Header View
//!
//! The input engine needs a handful of facts from the IP header that carried
//! a segment: the addresses, the pseudo-header checksum seed, the hop limit
//! and whether the packet was link-level broadcast or multicast. IPv4 and
//! IPv6 provide them through `NetworkHeaderView`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// IP protocol number of TCP.
pub const IPPROTO_TCP: u8 = 6;

/// Read-only view of the network header under a TCP segment.
pub trait NetworkHeaderView {
    fn src_addr(&self) -> IpAddr;
    fn dst_addr(&self) -> IpAddr;

    /// TTL (IPv4) or hop limit (IPv6).
    fn hop_limit(&self) -> u8;

    /// Unfolded one's complement sum of the pseudo header for a TCP
    /// segment of `tcp_len` bytes.
    fn pseudo_header_sum(&self, tcp_len: u32) -> u32;

    /// Resets must never be sent in answer to these.
    fn is_broadcast_or_multicast(&self) -> bool;
}

/// IPv4 header facts.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4View {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub ttl: u8,
    /// Set by the IP layer when the frame arrived as link-level broadcast
    /// or the destination is a directed broadcast of the receiving subnet.
    pub link_broadcast: bool,
}

impl Ipv4View {
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr) -> Self {
        Self { src, dst, ttl: 64, link_broadcast: false }
    }
}

impl NetworkHeaderView for Ipv4View {
    fn src_addr(&self) -> IpAddr {
        IpAddr::V4(self.src)
    }

    fn dst_addr(&self) -> IpAddr {
        IpAddr::V4(self.dst)
    }

    fn hop_limit(&self) -> u8 {
        self.ttl
    }

    fn pseudo_header_sum(&self, tcp_len: u32) -> u32 {
        let mut sum = sum_words(&self.src.octets(), 0);
        sum = sum_words(&self.dst.octets(), sum);
        sum += u32::from(IPPROTO_TCP);
        sum + (tcp_len & 0xffff) + (tcp_len >> 16)
    }

    fn is_broadcast_or_multicast(&self) -> bool {
        self.link_broadcast
            || self.dst.is_broadcast()
            || self.dst.is_multicast()
            || self.src.is_broadcast()
            || self.src.is_multicast()
    }
}

/// IPv6 header facts.
#[derive(Debug, Clone, Copy)]
pub struct Ipv6View {
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub hop_limit: u8,
}

impl Ipv6View {
    pub fn new(src: Ipv6Addr, dst: Ipv6Addr) -> Self {
        Self { src, dst, hop_limit: 64 }
    }
}

impl NetworkHeaderView for Ipv6View {
    fn src_addr(&self) -> IpAddr {
        IpAddr::V6(self.src)
    }

    fn dst_addr(&self) -> IpAddr {
        IpAddr::V6(self.dst)
    }

    fn hop_limit(&self) -> u8 {
        self.hop_limit
    }

    fn pseudo_header_sum(&self, tcp_len: u32) -> u32 {
        let mut sum = sum_words(&self.src.octets(), 0);
        sum = sum_words(&self.dst.octets(), sum);
        sum += (tcp_len & 0xffff) + (tcp_len >> 16);
        sum + u32::from(IPPROTO_TCP)
    }

    fn is_broadcast_or_multicast(&self) -> bool {
        // IPv6 has no broadcast.
        self.dst.is_multicast() || self.src.is_multicast()
    }
}

// ----------------------------------------------------------------------------
// Internet checksum (RFC 1071)
// ----------------------------------------------------------------------------

/// Add `data` as big-endian 16-bit words onto `sum`. An odd trailing byte
/// is padded with zero.
pub fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for w in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([w[0], w[1]])));
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(*last) << 8);
    }
    sum
}

/// Fold carries back into 16 bits.
pub fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// Checksum to place in a TCP header whose checksum field is zero.
pub fn tcp_checksum(net: &dyn NetworkHeaderView, segment: &[u8]) -> u16 {
    let sum = sum_words(segment, net.pseudo_header_sum(segment.len() as u32));
    !fold(sum)
}

/// Whether a received segment (checksum field included) verifies.
pub fn verify_tcp_checksum(net: &dyn NetworkHeaderView, segment: &[u8]) -> bool {
    let sum = sum_words(segment, net.pseudo_header_sum(segment.len() as u32));
    fold(sum) == 0xffff
}
