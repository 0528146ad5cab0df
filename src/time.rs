//! NTP timestamp codec and the datapath clock.
//!
//! Timestamps travel in the RFC 8762 NTP format: 32 bits of seconds since the
//! NTP epoch followed by 32 bits of fraction, each unit of fraction being
//! 2^-32 s (roughly 232 picoseconds). The packet path reads nanoseconds from
//! the kernel TAI clock, optionally removes the TAI-UTC offset and encodes the
//! result with [`NtpTimestamp::encode`].

use std::fmt;

use chrono::{DateTime, Utc};
use nix::time::{clock_gettime, ClockId};

/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch (1970-01-01).
pub const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Size of an NTP timestamp on the wire.
pub const NTP_TIMESTAMP_LEN: usize = 8;

/// NTP-format timestamp as carried in STAMP test packets.
///
/// Fields hold host-order values; [`NtpTimestamp::to_bytes`] and
/// [`NtpTimestamp::from_bytes`] perform the network byte order conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, PartialOrd, Ord)]
pub struct NtpTimestamp {
    /// Whole seconds since the NTP epoch.
    pub seconds: u32,
    /// Sub-second part in units of 2^-32 s.
    pub fraction: u32,
}

impl NtpTimestamp {
    /// Encodes nanoseconds since the Unix epoch.
    ///
    /// Seconds past the end of NTP era 0 (February 2036) are outside the
    /// representable range; callers must not pass them.
    #[must_use]
    pub fn encode(unix_ns: u64) -> Self {
        let secs = unix_ns / NANOS_PER_SEC + NTP_UNIX_OFFSET;
        let rem = unix_ns % NANOS_PER_SEC;
        debug_assert!(secs <= u64::from(u32::MAX), "timestamp beyond NTP era 0");

        // rem < 2^30, so rem << 32 stays below 2^62 and the quotient below 2^32.
        let fraction = (rem << 32) / NANOS_PER_SEC;

        Self {
            seconds: secs as u32,
            fraction: fraction as u32,
        }
    }

    /// Decodes to nanoseconds since the Unix epoch.
    ///
    /// The fraction is rounded to the nearest nanosecond, which makes
    /// `decode(encode(ns)) == ns` for every encodable `ns`. Timestamps before the
    /// Unix epoch are outside the representable range.
    #[must_use]
    pub fn decode(self) -> u64 {
        let secs = u64::from(self.seconds);
        debug_assert!(secs >= NTP_UNIX_OFFSET, "timestamp before the Unix epoch");

        let nanos = (u64::from(self.fraction) * NANOS_PER_SEC + (1 << 31)) >> 32;
        secs.wrapping_sub(NTP_UNIX_OFFSET)
            .wrapping_mul(NANOS_PER_SEC)
            .wrapping_add(nanos)
    }

    /// Serializes to network byte order.
    #[must_use]
    pub fn to_bytes(self) -> [u8; NTP_TIMESTAMP_LEN] {
        let mut buf = [0u8; NTP_TIMESTAMP_LEN];
        buf[..4].copy_from_slice(&self.seconds.to_be_bytes());
        buf[4..].copy_from_slice(&self.fraction.to_be_bytes());
        buf
    }

    /// Deserializes from network byte order.
    #[must_use]
    pub fn from_bytes(buf: [u8; NTP_TIMESTAMP_LEN]) -> Self {
        let [s0, s1, s2, s3, f0, f1, f2, f3] = buf;
        Self {
            seconds: u32::from_be_bytes([s0, s1, s2, s3]),
            fraction: u32::from_be_bytes([f0, f1, f2, f3]),
        }
    }
}

impl fmt::Display for NtpTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ns = self.decode();
        let secs = (ns / NANOS_PER_SEC) as i64;
        let nanos = (ns % NANOS_PER_SEC) as u32;
        match DateTime::<Utc>::from_timestamp(secs, nanos) {
            Some(dt) => write!(f, "{}", dt.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)),
            None => write!(f, "{}.{:010}", self.seconds, self.fraction),
        }
    }
}

/// Time source used by the packet path.
///
/// Implementations return nanoseconds on the TAI timescale, the same reading
/// an in-kernel program gets from `bpf_ktime_get_tai_ns`.
pub trait DatapathClock: Send + Sync {
    fn tai_ns(&self) -> u64;
}

/// Reads `CLOCK_TAI`.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelTaiClock;

impl KernelTaiClock {
    /// Current `CLOCK_TAI` reading in nanoseconds.
    pub fn read(&self) -> nix::Result<u64> {
        let ts = clock_gettime(ClockId::CLOCK_TAI)?;
        Ok((ts.tv_sec() as u64)
            .wrapping_mul(NANOS_PER_SEC)
            .wrapping_add(ts.tv_nsec() as u64))
    }
}

impl DatapathClock for KernelTaiClock {
    fn tai_ns(&self) -> u64 {
        // Readability is checked by the clock gatekeeper before any hook is
        // attached.
        self.read().unwrap_or(0)
    }
}
