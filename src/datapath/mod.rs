//! Per-packet STAMP engine.
//!
//! This is the logic the TCX programs run for every frame: classification,
//! timestamping and, for the reflector, turnaround. It is written under the
//! constraints of the in-kernel verifier:
//!
//! - every header access goes through [`load`] or a fixed-size array obtained
//!   after one explicit length check, so nothing reads past the frame end;
//! - no loop depends on packet contents;
//! - any failed check passes the frame through untouched.
//!
//! Header offsets are fixed: Ethernet II without VLAN tags followed by a
//! 20-byte IPv4 header and the UDP header. Frames with IP options or
//! non-first fragments are not classified as STAMP.

use std::net::Ipv4Addr;

use pnet::packet::{ip::IpNextHeaderProtocols, util::ipv4_checksum};

use crate::{error_estimate::ErrorEstimate, packets::STAMP_PACKET_LEN};

pub mod classifier;
pub mod reflector;
pub mod sender;

pub use classifier::Classifier;
pub use reflector::{ReflectorCounters, ReflectorEngine};
pub use sender::{ProbeSample, SenderCounters, SenderEngine};

/// Well-known TWAMP/STAMP port.
pub const STAMP_PORT: u16 = 862;

pub const ETH_HLEN: usize = 14;
pub const IPV4_HLEN: usize = 20;
pub const UDP_HLEN: usize = 8;

/// Offset of the STAMP payload inside the frame.
pub const STAMP_OFFSET: usize = ETH_HLEN + IPV4_HLEN + UDP_HLEN;
/// Shortest frame carrying a complete STAMP packet.
pub const STAMP_FRAME_LEN: usize = STAMP_OFFSET + STAMP_PACKET_LEN;

/// Absolute field offsets inside a frame.
pub(crate) mod offsets {
    use super::{ETH_HLEN, IPV4_HLEN};

    pub const ETH_DST: usize = 0;
    pub const ETH_SRC: usize = 6;
    pub const ETH_TYPE: usize = 12;
    pub const IP_VER_IHL: usize = ETH_HLEN;
    pub const IP_FRAG: usize = ETH_HLEN + 6;
    pub const IP_TTL: usize = ETH_HLEN + 8;
    pub const IP_PROTO: usize = ETH_HLEN + 9;
    pub const IP_SRC: usize = ETH_HLEN + 12;
    pub const IP_DST: usize = ETH_HLEN + 16;
    pub const UDP_SRC: usize = ETH_HLEN + IPV4_HLEN;
    pub const UDP_DST: usize = UDP_SRC + 2;
    pub const UDP_LEN: usize = UDP_SRC + 4;
    pub const UDP_CSUM: usize = UDP_SRC + 6;
}

/// Decision returned to the hook infrastructure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Continue with the next program / the stack, frame possibly stamped.
    Pass,
    /// Transmit the frame out of the given interface.
    Redirect { ifindex: u32 },
}

/// Read-only engine configuration, fixed before the first packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Probe address; `0.0.0.0` accepts any.
    pub local_addr: Ipv4Addr,
    /// STAMP UDP port, both source and destination.
    pub port: u16,
    /// Nanoseconds subtracted from TAI readings to get UTC.
    pub tai_offset_ns: u64,
    /// Error estimate stamped into outgoing timestamps.
    pub error_estimate: ErrorEstimate,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_addr: Ipv4Addr::UNSPECIFIED,
            port: STAMP_PORT,
            tai_offset_ns: 0,
            error_estimate: ErrorEstimate::for_clock(false, false),
        }
    }
}

impl EngineConfig {
    /// Converts a TAI clock reading to nanoseconds since the Unix epoch (UTC).
    pub fn unix_ns(&self, tai_ns: u64) -> u64 {
        tai_ns.saturating_sub(self.tai_offset_ns)
    }

    pub(crate) fn is_local(&self, addr: [u8; 4]) -> bool {
        self.local_addr.is_unspecified() || self.local_addr.octets() == addr
    }
}

/// Reads `N` bytes at `offset`, or `None` when the frame ends first.
#[inline(always)]
pub(crate) fn load<const N: usize>(frame: &[u8], offset: usize) -> Option<[u8; N]> {
    let end = offset.checked_add(N)?;
    frame.get(offset..end)?.try_into().ok()
}

/// Copies `N` bytes at `from` inside a fixed-size header block.
#[inline(always)]
pub(crate) fn field<const N: usize>(head: &[u8; STAMP_FRAME_LEN], from: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&head[from..from + N]);
    out
}

/// Swaps two equally sized, non-overlapping fields of a header block.
#[inline(always)]
pub(crate) fn swap_fields<const N: usize>(head: &mut [u8; STAMP_FRAME_LEN], a: usize, b: usize) {
    let first: [u8; N] = field(head, a);
    let second: [u8; N] = field(head, b);
    head[a..a + N].copy_from_slice(&second);
    head[b..b + N].copy_from_slice(&first);
}

/// Recomputes the UDP checksum after the payload changed.
///
/// A zero checksum means "not computed" for IPv4 and stays zero. When the UDP
/// length field does not describe the frame the checksum cannot be trusted and
/// is cleared instead.
pub(crate) fn refresh_udp_checksum(head: &mut [u8; STAMP_FRAME_LEN], tail: &[u8]) {
    use offsets::*;

    let current: [u8; 2] = field(head, UDP_CSUM);
    if current == [0, 0] {
        return;
    }

    let udp_len = u16::from_be_bytes(field(head, UDP_LEN)) as usize;
    let in_head = STAMP_FRAME_LEN - UDP_SRC;
    let extra = udp_len
        .checked_sub(in_head)
        .and_then(|extra_len| tail.get(..extra_len));

    let checksum = match extra {
        Some(extra) => {
            let source = Ipv4Addr::from(field::<4>(head, IP_SRC));
            let destination = Ipv4Addr::from(field::<4>(head, IP_DST));
            match ipv4_checksum(
                &head[UDP_SRC..],
                3,
                extra,
                &source,
                &destination,
                IpNextHeaderProtocols::Udp,
            ) {
                0 => 0xFFFF,
                sum => sum,
            }
        }
        None => 0,
    };
    head[UDP_CSUM..UDP_CSUM + 2].copy_from_slice(&checksum.to_be_bytes());
}
