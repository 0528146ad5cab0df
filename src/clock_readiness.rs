//! Startup check of the timing source.
//!
//! Timestamps are only meaningful when the local clock is disciplined. The
//! gatekeeper inspects the kernel clock state once, before any program is
//! attached, and either refuses to start (when the operator demanded
//! synchronization) or carries on with a warning.

use std::{fs, io, path::PathBuf};

use nix::{errno::Errno, libc};
use thiserror::Error;

use crate::{error_estimate::ErrorEstimate, time::KernelTaiClock};

/// Daemons whose presence means the system clock follows a PTP grandmaster.
const PTP_DAEMONS: &[&str] = &["ptp4l", "phc2sys", "timemaster"];

#[derive(Error, Debug)]
pub enum ClockError {
    #[error("No clock syncing detected with --enforce-sync flag set")]
    NotSynchronized,
    #[error("No PTP syncing detected with --enforce-ptp flag set")]
    PtpNotSynchronized,
    #[error("Cannot read kernel clock state: {0}")]
    Probe(#[from] io::Error),
    #[error("CLOCK_TAI is not readable: {0}")]
    TaiUnavailable(Errno),
}

/// Raw clock state as reported by the system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockStatus {
    /// The kernel considers the system clock synchronized.
    pub synchronized: bool,
    /// A PTP daemon disciplines the clock.
    pub ptp: bool,
    /// TAI-UTC offset known to the kernel, in seconds. Zero when unset.
    pub tai_offset_secs: i32,
}

/// Source of [`ClockStatus`].
pub trait ClockProbe {
    fn status(&self) -> Result<ClockStatus, ClockError>;

    /// Checks that the clock the packet path stamps from can be read.
    fn tai_clock(&self) -> Result<(), ClockError>;
}

/// Reads clock state from `adjtimex` and the process table.
#[derive(Debug, Clone)]
pub struct KernelClockProbe {
    proc_root: PathBuf,
}

impl Default for KernelClockProbe {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
        }
    }
}

impl KernelClockProbe {
    fn timex() -> Result<(libc::c_int, libc::timex), ClockError> {
        #[cfg(target_env = "musl")]
        use libc::adjtimex as adjtime;
        #[cfg(not(target_env = "musl"))]
        use libc::ntp_adjtime as adjtime;

        // An all-zero timex with modes == 0 only reads the state.
        let mut timex: libc::timex = unsafe { std::mem::zeroed() };
        // The pointer refers to a valid, exclusively borrowed timex.
        let state = unsafe { adjtime(&mut timex) };
        if state == -1 {
            return Err(ClockError::Probe(io::Error::last_os_error()));
        }
        Ok((state, timex))
    }

    fn ptp_daemon_running(&self) -> bool {
        let Ok(entries) = fs::read_dir(&self.proc_root) else {
            return false;
        };
        entries
            .filter_map(Result::ok)
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.bytes().all(|b| b.is_ascii_digit()))
            })
            .filter_map(|entry| fs::read_to_string(entry.path().join("comm")).ok())
            .any(|comm| PTP_DAEMONS.contains(&comm.trim()))
    }
}

impl ClockProbe for KernelClockProbe {
    fn status(&self) -> Result<ClockStatus, ClockError> {
        let (state, timex) = Self::timex()?;
        let synchronized = state != libc::TIME_ERROR && (timex.status & libc::STA_UNSYNC) == 0;

        Ok(ClockStatus {
            synchronized,
            ptp: synchronized && self.ptp_daemon_running(),
            tai_offset_secs: timex.tai,
        })
    }

    fn tai_clock(&self) -> Result<(), ClockError> {
        KernelTaiClock
            .read()
            .map(|_| ())
            .map_err(ClockError::TaiUnavailable)
    }
}

/// Operator demands on the clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockRequirements {
    pub enforce_sync: bool,
    pub enforce_ptp: bool,
    pub disable_tai: bool,
}

/// Outcome of the clock check, consumed by the engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockAssessment {
    /// TAI readings must be shifted to UTC before encoding.
    pub tai_required: bool,
    pub sync_present: bool,
    pub ptp_present: bool,
    pub tai_offset_secs: i32,
}

impl ClockAssessment {
    /// Offset the packet path subtracts from TAI readings.
    pub fn tai_offset_ns(&self) -> u64 {
        if self.tai_required {
            u64::from(self.tai_offset_secs.unsigned_abs()) * 1_000_000_000
        } else {
            0
        }
    }

    pub fn error_estimate(&self) -> ErrorEstimate {
        ErrorEstimate::for_clock(self.sync_present, self.ptp_present)
    }
}

/// Evaluates the clock once at startup.
///
/// # Errors
/// `TaiUnavailable` when `CLOCK_TAI` cannot be read, whatever the
/// requirements. `NotSynchronized` when no synchronization is detected and
/// sync or PTP is enforced; `PtpNotSynchronized` when the clock is
/// synchronized without PTP and PTP is enforced.
pub fn assess_clock(
    probe: &impl ClockProbe,
    requirements: &ClockRequirements,
) -> Result<ClockAssessment, ClockError> {
    probe.tai_clock()?;

    let status = match probe.status() {
        Ok(status) => status,
        Err(e) => {
            log::warn!("{}, treating the clock as unsynchronized", e);
            ClockStatus::default()
        }
    };

    if !status.synchronized {
        if requirements.enforce_sync || requirements.enforce_ptp {
            return Err(ClockError::NotSynchronized);
        }
        log::warn!("No clock syncing detected, timestamps may be meaningless");
    } else if !status.ptp {
        if requirements.enforce_ptp {
            return Err(ClockError::PtpNotSynchronized);
        }
        log::warn!("Clock is synchronized without PTP, expect reduced timestamp accuracy");
    }

    let tai_required = status.tai_offset_secs != 0 && !requirements.disable_tai;
    if requirements.disable_tai && status.tai_offset_secs != 0 {
        log::warn!(
            "TAI adjustment disabled, timestamps will be {}s ahead of UTC",
            status.tai_offset_secs
        );
    }

    let assessment = ClockAssessment {
        tai_required,
        sync_present: status.synchronized,
        ptp_present: status.ptp,
        tai_offset_secs: status.tai_offset_secs,
    };
    log::info!(
        "Clock: sync={} ptp={} tai_offset={}s tai_adjust={} advertised_error={:e}s",
        assessment.sync_present,
        assessment.ptp_present,
        assessment.tai_offset_secs,
        assessment.tai_required,
        assessment.error_estimate().error_seconds()
    );
    Ok(assessment)
}
