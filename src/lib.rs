//! stamp-tcx - STAMP (RFC 8762) probe timestamping in the kernel fast path.
//!
//! The Session-Sender stamps probes on TCX egress and the Session-Reflector
//! turns them around on TCX ingress, so timestamps are taken as close to the
//! wire as the host allows.
//!
//! # Usage
//!
//! Run as a reflector:
//! ```bash
//! stamp-tcx --role reflector -i eth0 --image stamp.bpf.o
//! ```
//!
//! Run as a sender placed in front of an existing CNI program:
//! ```bash
//! stamp-tcx --role sender -i eth0 --anchor before --anchor-reference cil_
//! ```

/// Hook attachment, anchor ordering and teardown.
pub mod attach;
/// Startup check of clock synchronization and TAI offset.
pub mod clock_readiness;
/// Command-line configuration and validation.
pub mod configuration;
/// Per-packet classification, stamping and turnaround.
pub mod datapath;
/// Error estimate encoding/decoding for timestamps.
pub mod error_estimate;
/// Bring-up of the sender and reflector roles.
pub mod loader;
/// STAMP packet structures and serialization.
pub mod packets;
/// Sequence numbering.
pub mod session;
/// NTP timestamp codec and datapath clock.
pub mod time;
