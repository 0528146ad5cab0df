use std::{net::Ipv4Addr, path::PathBuf};

pub use clap::Parser;
use thiserror::Error;

use crate::{
    attach::{anchor::DEFAULT_REFERENCE_PREFIX, AnchorPosition, Role},
    clock_readiness::ClockRequirements,
    datapath::STAMP_PORT,
    loader::ProbeConfig,
};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Port 0 is not a valid STAMP port")]
    InvalidPort,
    #[error("No interface given")]
    MissingInterface,
    #[error("--anchor {0} needs a non-empty --anchor-reference")]
    MissingAnchorReference(AnchorPosition),
}

#[derive(Parser, Debug, Clone)]
#[clap(version, about = "STAMP probe running on TCX hooks", long_about = None)]
pub struct Configuration {
    /// Probe role
    #[clap(short, long, value_enum)]
    pub role: Role,
    /// Interface to attach to
    #[clap(short, long)]
    pub interface: String,
    /// Local IPv4 address, 0.0.0.0 accepts any
    #[clap(short, long, default_value = "0.0.0.0")]
    pub local_addr: Ipv4Addr,
    /// STAMP UDP port
    #[clap(short, long, default_value_t = STAMP_PORT)]
    pub port: u16,
    /// Refuse to start without a synchronized clock
    #[clap(long)]
    pub enforce_sync: bool,
    /// Refuse to start without a PTP synchronized clock
    #[clap(long)]
    pub enforce_ptp: bool,
    /// Do not shift TAI readings to UTC
    #[clap(long)]
    pub disable_tai: bool,
    /// Verbose logging and verifier output
    #[clap(short, long)]
    pub debug: bool,
    /// Placement relative to an already attached program
    #[clap(long, value_enum, default_value_t = AnchorPosition::Default)]
    pub anchor: AnchorPosition,
    /// Name prefix of the program to place relative to
    #[clap(long, default_value = DEFAULT_REFERENCE_PREFIX)]
    pub anchor_reference: String,
    /// Compiled program image
    #[clap(long, default_value = "stamp.bpf.o")]
    pub image: PathBuf,
}

impl Configuration {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.port == 0 {
            return Err(ConfigurationError::InvalidPort);
        }
        if self.interface.trim().is_empty() {
            return Err(ConfigurationError::MissingInterface);
        }
        if self.anchor != AnchorPosition::Default && self.anchor_reference.is_empty() {
            return Err(ConfigurationError::MissingAnchorReference(self.anchor));
        }
        Ok(())
    }

    pub fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            role: self.role,
            interface: self.interface.clone(),
            local_addr: self.local_addr,
            port: self.port,
            clock: ClockRequirements {
                enforce_sync: self.enforce_sync,
                enforce_ptp: self.enforce_ptp,
                disable_tai: self.disable_tai,
            },
            anchor: self.anchor,
            anchor_reference: self.anchor_reference.clone(),
            image: self.image.clone(),
            debug: self.debug,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Configuration {
        Configuration::try_parse_from(std::iter::once("stamp-tcx").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let conf = parse(&["--role", "reflector", "-i", "eth0"]);
        assert_eq!(conf.role, Role::Reflector);
        assert_eq!(conf.local_addr, Ipv4Addr::UNSPECIFIED);
        assert_eq!(conf.port, 862);
        assert_eq!(conf.anchor, AnchorPosition::Default);
        assert_eq!(conf.anchor_reference, "cil_");
        assert!(!conf.enforce_sync && !conf.enforce_ptp && !conf.disable_tai);
        assert_eq!(conf.validate(), Ok(()));
    }

    #[test]
    fn test_full_command_line() {
        let conf = parse(&[
            "-r",
            "sender",
            "--interface",
            "ens3",
            "-l",
            "192.0.2.1",
            "-p",
            "4000",
            "--enforce-ptp",
            "--disable-tai",
            "--anchor",
            "before",
            "--image",
            "/opt/stamp/stamp.bpf.o",
        ]);
        let probe = conf.probe_config();
        assert_eq!(probe.role, Role::Sender);
        assert_eq!(probe.local_addr, Ipv4Addr::new(192, 0, 2, 1));
        assert_eq!(probe.port, 4000);
        assert!(probe.clock.enforce_ptp);
        assert!(probe.clock.disable_tai);
        assert_eq!(probe.anchor, AnchorPosition::BeforeReference);
        assert_eq!(probe.image, PathBuf::from("/opt/stamp/stamp.bpf.o"));
    }

    #[test]
    fn test_invalid_values_rejected_by_parser() {
        let args = ["stamp-tcx", "--role", "observer", "-i", "eth0"];
        assert!(Configuration::try_parse_from(args).is_err());
        let args = ["stamp-tcx", "--role", "sender", "-i", "eth0", "-l", "::1"];
        assert!(Configuration::try_parse_from(args).is_err());
        let args = ["stamp-tcx", "--role", "sender", "-i", "eth0", "--anchor", "middle"];
        assert!(Configuration::try_parse_from(args).is_err());
    }

    #[test]
    fn test_validate_port_zero() {
        let conf = parse(&["--role", "sender", "-i", "eth0", "-p", "0"]);
        assert_eq!(conf.validate(), Err(ConfigurationError::InvalidPort));
    }

    #[test]
    fn test_validate_empty_interface() {
        let conf = parse(&["--role", "sender", "-i", " "]);
        assert_eq!(conf.validate(), Err(ConfigurationError::MissingInterface));
    }

    #[test]
    fn test_validate_relative_anchor_needs_reference() {
        let conf = parse(&[
            "--role",
            "sender",
            "-i",
            "eth0",
            "--anchor",
            "after",
            "--anchor-reference",
            "",
        ]);
        assert_eq!(
            conf.validate(),
            Err(ConfigurationError::MissingAnchorReference(
                AnchorPosition::AfterReference
            ))
        );

        let conf = parse(&["--role", "sender", "-i", "eth0", "--anchor-reference", ""]);
        assert_eq!(conf.validate(), Ok(()));
    }
}
