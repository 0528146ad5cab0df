//! STAMP packet structures as defined in RFC 8762.
//!
//! Only the unauthenticated formats are carried by the TCX engine. Both are
//! 44 bytes long, which lets the reflector rewrite a test packet into its
//! reflected counterpart in place.

use crate::time::NtpTimestamp;

/// Length of both unauthenticated STAMP payloads.
pub const STAMP_PACKET_LEN: usize = 44;

/// Unauthenticated STAMP test packet sent by the Session-Sender.
///
/// See RFC 8762 Section 4.2.1.
///
/// Wire format:
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                        Sequence Number                       |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                          Timestamp                           |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |         Error Estimate        |                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+                               +
/// |                         MBZ (30 octets)                       |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SenderPacket {
    /// Probe sequence number assigned by the sender.
    pub seq: u32,
    /// Egress timestamp (t1).
    pub t1: NtpTimestamp,
    /// Error estimate of t1.
    pub error_estimate: u16,
    /// Must Be Zero.
    pub mbz: [u8; 30],
}

/// Byte offsets of the [`SenderPacket`] fields.
pub mod sender_offsets {
    pub const SEQ: usize = 0;
    pub const T1: usize = 4;
    pub const ERROR_ESTIMATE: usize = 12;
    pub const MBZ: usize = 14;
}

impl SenderPacket {
    /// Serializes the packet to a 44-byte array in big-endian wire format.
    pub fn to_bytes(&self) -> [u8; STAMP_PACKET_LEN] {
        use sender_offsets::*;

        let mut buf = [0u8; STAMP_PACKET_LEN];
        buf[SEQ..T1].copy_from_slice(&self.seq.to_be_bytes());
        buf[T1..ERROR_ESTIMATE].copy_from_slice(&self.t1.to_bytes());
        buf[ERROR_ESTIMATE..MBZ].copy_from_slice(&self.error_estimate.to_be_bytes());
        buf[MBZ..].copy_from_slice(&self.mbz);
        buf
    }

    /// Deserializes a packet from big-endian wire format.
    ///
    /// # Errors
    /// Returns an error if the buffer is smaller than 44 bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, &'static str> {
        let buf: &[u8; STAMP_PACKET_LEN] = buf
            .get(..STAMP_PACKET_LEN)
            .and_then(|b| b.try_into().ok())
            .ok_or("Buffer too small for SenderPacket")?;
        Ok(Self::from_array(buf))
    }

    pub(crate) fn from_array(buf: &[u8; STAMP_PACKET_LEN]) -> Self {
        let mut mbz = [0u8; 30];
        mbz.copy_from_slice(&buf[14..44]);
        Self {
            seq: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            t1: NtpTimestamp::from_bytes([
                buf[4], buf[5], buf[6], buf[7], buf[8], buf[9], buf[10], buf[11],
            ]),
            error_estimate: u16::from_be_bytes([buf[12], buf[13]]),
            mbz,
        }
    }
}

/// Unauthenticated STAMP reflected packet sent by the Session-Reflector.
///
/// See RFC 8762 Section 4.3.1.
///
/// Wire format:
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                        Sequence Number                       |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                          Timestamp                           |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |         Error Estimate        |           MBZ                 |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       Receive Timestamp                       |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                  Session-Sender Seq Number                    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                  Session-Sender Timestamp                     |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | Session-Sender Error Estimate |           MBZ                 |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |Ses-Sender TTL |                      MBZ                      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReflectorPacket {
    /// Reflector's own sequence number.
    pub seq: u32,
    /// Reflector send timestamp (t3).
    pub t3: NtpTimestamp,
    /// Reflector's error estimate.
    pub error_estimate: u16,
    pub mbz1: u16,
    /// Reflector receive timestamp (t2).
    pub t2: NtpTimestamp,
    /// Sender's sequence number, echoed back.
    pub sender_seq: u32,
    /// Sender's timestamp (t1), echoed back.
    pub sender_t1: NtpTimestamp,
    /// Sender's error estimate, echoed back.
    pub sender_error_estimate: u16,
    pub mbz2: u16,
    /// TTL of the received test packet.
    pub sender_ttl: u8,
    pub mbz3: [u8; 3],
}

/// Byte offsets of the [`ReflectorPacket`] fields.
pub mod reflector_offsets {
    pub const SEQ: usize = 0;
    pub const T3: usize = 4;
    pub const ERROR_ESTIMATE: usize = 12;
    pub const MBZ1: usize = 14;
    pub const T2: usize = 16;
    pub const SENDER_SEQ: usize = 24;
    pub const SENDER_T1: usize = 28;
    pub const SENDER_ERROR_ESTIMATE: usize = 36;
    pub const MBZ2: usize = 38;
    pub const SENDER_TTL: usize = 40;
    pub const MBZ3: usize = 41;
}

impl ReflectorPacket {
    /// Builds the reflected packet for `request`.
    ///
    /// Sequence number, timestamp and error estimate of the sender are copied
    /// verbatim.
    pub fn reflect(
        request: &SenderPacket,
        seq: u32,
        t2: NtpTimestamp,
        t3: NtpTimestamp,
        error_estimate: u16,
        sender_ttl: u8,
    ) -> Self {
        Self {
            seq,
            t3,
            error_estimate,
            mbz1: 0,
            t2,
            sender_seq: request.seq,
            sender_t1: request.t1,
            sender_error_estimate: request.error_estimate,
            mbz2: 0,
            sender_ttl,
            mbz3: [0; 3],
        }
    }

    /// Serializes the packet to a 44-byte array in big-endian wire format.
    pub fn to_bytes(&self) -> [u8; STAMP_PACKET_LEN] {
        use reflector_offsets::*;

        let mut buf = [0u8; STAMP_PACKET_LEN];
        buf[SEQ..T3].copy_from_slice(&self.seq.to_be_bytes());
        buf[T3..ERROR_ESTIMATE].copy_from_slice(&self.t3.to_bytes());
        buf[ERROR_ESTIMATE..MBZ1].copy_from_slice(&self.error_estimate.to_be_bytes());
        buf[MBZ1..T2].copy_from_slice(&self.mbz1.to_be_bytes());
        buf[T2..SENDER_SEQ].copy_from_slice(&self.t2.to_bytes());
        buf[SENDER_SEQ..SENDER_T1].copy_from_slice(&self.sender_seq.to_be_bytes());
        buf[SENDER_T1..SENDER_ERROR_ESTIMATE].copy_from_slice(&self.sender_t1.to_bytes());
        buf[SENDER_ERROR_ESTIMATE..MBZ2]
            .copy_from_slice(&self.sender_error_estimate.to_be_bytes());
        buf[MBZ2..SENDER_TTL].copy_from_slice(&self.mbz2.to_be_bytes());
        buf[SENDER_TTL] = self.sender_ttl;
        buf[MBZ3..].copy_from_slice(&self.mbz3);
        buf
    }

    /// Deserializes a packet from big-endian wire format.
    ///
    /// # Errors
    /// Returns an error if the buffer is smaller than 44 bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, &'static str> {
        let buf: &[u8; STAMP_PACKET_LEN] = buf
            .get(..STAMP_PACKET_LEN)
            .and_then(|b| b.try_into().ok())
            .ok_or("Buffer too small for ReflectorPacket")?;
        Ok(Self::from_array(buf))
    }

    pub(crate) fn from_array(buf: &[u8; STAMP_PACKET_LEN]) -> Self {
        let ts = |at: usize| {
            NtpTimestamp::from_bytes([
                buf[at],
                buf[at + 1],
                buf[at + 2],
                buf[at + 3],
                buf[at + 4],
                buf[at + 5],
                buf[at + 6],
                buf[at + 7],
            ])
        };
        Self {
            seq: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            t3: ts(4),
            error_estimate: u16::from_be_bytes([buf[12], buf[13]]),
            mbz1: u16::from_be_bytes([buf[14], buf[15]]),
            t2: ts(16),
            sender_seq: u32::from_be_bytes([buf[24], buf[25], buf[26], buf[27]]),
            sender_t1: ts(28),
            sender_error_estimate: u16::from_be_bytes([buf[36], buf[37]]),
            mbz2: u16::from_be_bytes([buf[38], buf[39]]),
            sender_ttl: buf[40],
            mbz3: [buf[41], buf[42], buf[43]],
        }
    }
}
