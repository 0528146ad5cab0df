//! Error estimate field of STAMP timestamps (RFC 8762 Section 4.2.1).
//!
//! 16-bit format: S (1 bit) | Z (1 bit) | Scale (6 bits) | Multiplier (8 bits).
//! The error in seconds is Multiplier × 2^(Scale - 32). The TCX engine always
//! emits NTP-format timestamps, so Z is always 0 in what it stamps.

/// Error estimate for STAMP timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorEstimate {
    /// S bit: the clock is synchronized to UTC.
    pub synchronized: bool,
    /// Z bit: 0 = NTP format, 1 = PTP format.
    pub z_flag: bool,
    /// Scale factor (0-63).
    pub scale: u8,
    /// Multiplier (0-255).
    pub multiplier: u8,
}

impl ErrorEstimate {
    /// Picks the estimate advertised for the detected clock discipline.
    ///
    /// PTP-disciplined clocks advertise 2^-20 s (about 1 µs), other
    /// synchronized clocks 2^-10 s (about 1 ms). Unsynchronized clocks clear
    /// S and advertise the smallest non-zero error.
    #[must_use]
    pub fn for_clock(sync_present: bool, ptp_present: bool) -> Self {
        let (scale, multiplier) = match (sync_present, ptp_present) {
            (true, true) => (12, 1),
            (true, false) => (22, 1),
            (false, _) => (0, 1),
        };
        Self {
            synchronized: sync_present,
            z_flag: false,
            scale,
            multiplier,
        }
    }

    /// Parses the 16-bit wire form.
    #[must_use]
    pub fn from_wire(value: u16) -> Self {
        Self {
            synchronized: (value & 0x8000) != 0,
            z_flag: (value & 0x4000) != 0,
            scale: ((value >> 8) & 0x3F) as u8,
            multiplier: (value & 0xFF) as u8,
        }
    }

    /// Wire form, S in the most significant bit.
    #[must_use]
    pub fn to_wire(&self) -> u16 {
        u16::from(self.synchronized) << 15
            | u16::from(self.z_flag) << 14
            | u16::from(self.scale & 0x3F) << 8
            | u16::from(self.multiplier)
    }

    /// Advertised error in seconds, `multiplier * 2^(scale - 32)`.
    #[must_use]
    pub fn error_seconds(&self) -> f64 {
        f64::from(self.multiplier) * 2f64.powi(i32::from(self.scale) - 32)
    }
}

impl From<u16> for ErrorEstimate {
    fn from(value: u16) -> Self {
        Self::from_wire(value)
    }
}

impl From<ErrorEstimate> for u16 {
    fn from(estimate: ErrorEstimate) -> Self {
        estimate.to_wire()
    }
}
