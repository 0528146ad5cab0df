//! Decides whether a frame is STAMP traffic for this probe.

use pnet::packet::{ethernet::EtherTypes, ip::IpNextHeaderProtocols};

use super::{load, offsets, STAMP_PORT};

const FRAGMENT_OFFSET_MASK: u16 = 0x1FFF;

/// Matches Ethernet + IPv4 + UDP frames whose source and destination port are
/// both the STAMP port. The IPv4 header must be option-free (IHL 5) and the
/// packet must not be a non-first fragment, otherwise the UDP header is not
/// where the fixed offsets expect it.
///
/// Read-only and free of side effects; used on ingress and egress alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classifier {
    port: u16,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(STAMP_PORT)
    }
}

impl Classifier {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    /// Returns `true` for STAMP frames. Frames too short for any of the
    /// inspected fields never match.
    pub fn matches(&self, frame: &[u8]) -> bool {
        use offsets::*;

        let Some(ethertype) = load::<2>(frame, ETH_TYPE) else {
            return false;
        };
        if u16::from_be_bytes(ethertype) != EtherTypes::Ipv4.0 {
            return false;
        }

        let Some([version_ihl]) = load::<1>(frame, IP_VER_IHL) else {
            return false;
        };
        if version_ihl != 0x45 {
            return false;
        }

        let Some(flags_fragment) = load::<2>(frame, IP_FRAG) else {
            return false;
        };
        if u16::from_be_bytes(flags_fragment) & FRAGMENT_OFFSET_MASK != 0 {
            return false;
        }

        let Some([proto]) = load::<1>(frame, IP_PROTO) else {
            return false;
        };
        if proto != IpNextHeaderProtocols::Udp.0 {
            return false;
        }

        // Both ports sit at the end of the UDP header; check the full header
        // is present before reading them.
        if load::<2>(frame, UDP_CSUM).is_none() {
            return false;
        }
        let (Some(source), Some(destination)) =
            (load::<2>(frame, UDP_SRC), load::<2>(frame, UDP_DST))
        else {
            return false;
        };

        u16::from_be_bytes(source) == self.port && u16::from_be_bytes(destination) == self.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapath::{ETH_HLEN, IPV4_HLEN, UDP_HLEN};

    fn stamp_headers(src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut frame = vec![0u8; ETH_HLEN + IPV4_HLEN + UDP_HLEN];
        frame[12..14].copy_from_slice(&[0x08, 0x00]);
        frame[14] = 0x45;
        frame[23] = 17;
        frame[34..36].copy_from_slice(&src_port.to_be_bytes());
        frame[36..38].copy_from_slice(&dst_port.to_be_bytes());
        frame[38..40].copy_from_slice(&8u16.to_be_bytes());
        frame
    }

    #[test]
    fn test_minimal_stamp_frame_matches() {
        let frame = stamp_headers(862, 862);
        assert_eq!(frame.len(), 42);
        assert!(Classifier::default().matches(&frame));
    }

    #[test]
    fn test_truncated_frame_does_not_match() {
        let frame = stamp_headers(862, 862);
        let classifier = Classifier::default();
        assert!(!classifier.matches(&frame[..30]));
        assert!(!classifier.matches(&frame[..41]));
        assert!(!classifier.matches(&frame[..13]));
        assert!(!classifier.matches(&[]));
    }

    #[test]
    fn test_wrong_ethertype() {
        let mut frame = stamp_headers(862, 862);
        frame[12..14].copy_from_slice(&[0x86, 0xDD]);
        assert!(!Classifier::default().matches(&frame));
    }

    #[test]
    fn test_wrong_ip_protocol() {
        let mut frame = stamp_headers(862, 862);
        frame[23] = 6;
        assert!(!Classifier::default().matches(&frame));
    }

    #[test]
    fn test_both_ports_required() {
        let classifier = Classifier::default();
        assert!(!classifier.matches(&stamp_headers(862, 863)));
        assert!(!classifier.matches(&stamp_headers(40000, 862)));
        assert!(!classifier.matches(&stamp_headers(1, 1)));
    }

    #[test]
    fn test_ip_options_do_not_match() {
        // IHL 6: the option bytes sit where a 20-byte header keeps the ports.
        let mut frame = stamp_headers(53, 53);
        frame[14] = 0x46;
        frame[34..38].copy_from_slice(&[0x03, 0x5E, 0x03, 0x5E]);
        frame.extend_from_slice(&[0u8; 4]);
        assert!(!Classifier::default().matches(&frame));
    }

    #[test]
    fn test_wrong_ip_version() {
        let mut frame = stamp_headers(862, 862);
        frame[14] = 0x65;
        assert!(!Classifier::default().matches(&frame));
    }

    #[test]
    fn test_non_first_fragment_does_not_match() {
        let mut frame = stamp_headers(862, 862);
        frame[20..22].copy_from_slice(&185u16.to_be_bytes());
        assert!(!Classifier::default().matches(&frame));
    }

    #[test]
    fn test_first_fragment_and_dont_fragment_match() {
        let classifier = Classifier::default();
        let mut frame = stamp_headers(862, 862);
        // MF set, offset 0.
        frame[20..22].copy_from_slice(&0x2000u16.to_be_bytes());
        assert!(classifier.matches(&frame));
        // DF set.
        frame[20..22].copy_from_slice(&0x4000u16.to_be_bytes());
        assert!(classifier.matches(&frame));
    }

    #[test]
    fn test_custom_port() {
        let classifier = Classifier::new(4000);
        assert!(classifier.matches(&stamp_headers(4000, 4000)));
        assert!(!classifier.matches(&stamp_headers(862, 862)));
    }
}
