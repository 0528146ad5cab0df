//! Kernel [`HookRuntime`] backed by aya: loads the compiled STAMP program
//! image and attaches its classifiers through TCX links.

use std::path::{Path, PathBuf};

use aya::{
    programs::{
        links::{Link, LinkOrder},
        tc::{SchedClassifierLink, TcAttachOptions},
        ProgramError, ProgramId, SchedClassifier, TcAttachType,
    },
    Ebpf, EbpfLoader, VerifierLogLevel,
};
use thiserror::Error;

use super::{
    anchor::{Anchor, ReferenceProgram},
    AttachError, AttachTarget, Direction, HookPoint, HookRuntime, Role,
};
use crate::{clock_readiness::ClockAssessment, datapath::EngineConfig};

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Cannot load program image {path}: {reason}")]
    Image { path: PathBuf, reason: String },
    #[error("Program {0} missing from the image")]
    ProgramMissing(String),
    #[error("Program {program} rejected by the verifier:\n{log}")]
    Verifier { program: String, log: String },
    #[error("Cannot load program {program}: {reason}")]
    Program { program: String, reason: String },
}

/// Values patched into the image's global variables before loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramGlobals {
    /// Local IPv4 address, octets in wire order as read by the program.
    pub laddr: u32,
    pub s_port: u16,
    /// Non-zero when TAI readings need shifting to UTC.
    pub tai: u16,
    pub disable_tai: u16,
    /// TAI-UTC offset in seconds.
    pub tai_offset: u32,
}

impl ProgramGlobals {
    pub fn new(engine: &EngineConfig, clock: &ClockAssessment, disable_tai: bool) -> Self {
        Self {
            laddr: u32::from_le_bytes(engine.local_addr.octets()),
            s_port: engine.port,
            tai: u16::from(clock.tai_required),
            disable_tai: u16::from(disable_tai),
            tai_offset: clock.tai_offset_secs.unsigned_abs(),
        }
    }
}

impl From<Direction> for TcAttachType {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Ingress => TcAttachType::Ingress,
            Direction::Egress => TcAttachType::Egress,
        }
    }
}

/// Program image of one role, loaded into the kernel.
pub struct TcxRuntime {
    role: Role,
    ebpf: Ebpf,
}

impl TcxRuntime {
    /// Loads and verifies both programs of `role` from the object at `image`.
    pub fn load(
        role: Role,
        image: &Path,
        globals: &ProgramGlobals,
        debug: bool,
    ) -> Result<Self, LoadError> {
        let log_level = if debug {
            VerifierLogLevel::VERBOSE | VerifierLogLevel::STATS
        } else {
            VerifierLogLevel::default()
        };

        let mut ebpf = EbpfLoader::new()
            .set_global("LADDR", &globals.laddr, true)
            .set_global("S_PORT", &globals.s_port, true)
            .set_global("TAI", &globals.tai, true)
            .set_global("DISABLE_TAI", &globals.disable_tai, true)
            .set_global("TAI_OFFSET", &globals.tai_offset, true)
            .verifier_log_level(log_level)
            .load_file(image)
            .map_err(|e| LoadError::Image {
                path: image.to_path_buf(),
                reason: e.to_string(),
            })?;

        for hook in role.hooks() {
            let program: &mut SchedClassifier = ebpf
                .program_mut(hook.program)
                .ok_or_else(|| LoadError::ProgramMissing(hook.program.to_string()))?
                .try_into()
                .map_err(|e: ProgramError| LoadError::Program {
                    program: hook.program.to_string(),
                    reason: e.to_string(),
                })?;

            program.load().map_err(|e| match e {
                ProgramError::LoadError { verifier_log, .. } => {
                    let log = verifier_log.to_string();
                    log::debug!("Verifier log of {}:\n{}", hook.program, log);
                    LoadError::Verifier {
                        program: hook.program.to_string(),
                        log,
                    }
                }
                e => LoadError::Program {
                    program: hook.program.to_string(),
                    reason: e.to_string(),
                },
            })?;
        }

        log::info!("Loaded and verified the {} programs from {}", role, image.display());
        Ok(Self { role, ebpf })
    }

    fn classifier(&mut self, name: &str) -> Result<&mut SchedClassifier, AttachError> {
        self.ebpf
            .program_mut(name)
            .ok_or_else(|| AttachError::ProgramNotFound(name.to_string()))?
            .try_into()
            .map_err(|_: ProgramError| AttachError::ProgramNotFound(name.to_string()))
    }
}

impl HookRuntime for TcxRuntime {
    type Link = SchedClassifierLink;

    fn resolve_interface(&self, name: &str) -> Result<AttachTarget, AttachError> {
        pnet::datalink::interfaces()
            .into_iter()
            .find(|iface| iface.name == name)
            .map(|iface| AttachTarget {
                name: iface.name,
                index: iface.index,
            })
            .ok_or_else(|| AttachError::InterfaceNotFound(name.to_string()))
    }

    fn find_reference(
        &self,
        target: &AttachTarget,
        direction: Direction,
        prefix: &str,
    ) -> Result<ReferenceProgram, AttachError> {
        let not_found = || AttachError::ReferenceNotFound {
            interface: target.name.clone(),
            direction,
            prefix: prefix.to_string(),
        };

        let (_revision, programs) = SchedClassifier::query_tcx(&target.name, direction.into())
            .map_err(|e| {
                log::debug!("TCX query on {} {} failed: {}", target, direction, e);
                not_found()
            })?;

        programs
            .iter()
            .find_map(|info| {
                let name = info.name_as_str()?;
                name.starts_with(prefix).then(|| ReferenceProgram {
                    id: info.id(),
                    name: name.to_string(),
                })
            })
            .ok_or_else(not_found)
    }

    fn attach(
        &mut self,
        hook: HookPoint,
        target: &AttachTarget,
        anchor: &Anchor,
    ) -> Result<Self::Link, AttachError> {
        let failed = |e: ProgramError| AttachError::Attach {
            hook,
            interface: target.name.clone(),
            reason: e.to_string(),
        };

        // SAFETY: the ids come from a TCX query of the same hook; a program
        // detached in between makes the kernel reject the attach.
        let order = match anchor {
            Anchor::Head => LinkOrder::first(),
            Anchor::Before(r) => LinkOrder::before_program_id(unsafe { ProgramId::new(r.id) }),
            Anchor::After(r) => LinkOrder::after_program_id(unsafe { ProgramId::new(r.id) }),
        };

        let program = self.classifier(hook.program)?;
        let link_id = program
            .attach_with_options(
                &target.name,
                hook.direction.into(),
                TcAttachOptions::TcxOrder(order),
            )
            .map_err(failed)?;
        program.take_link(link_id).map_err(failed)
    }

    fn detach(&mut self, link: Self::Link) -> Result<(), AttachError> {
        link.detach().map_err(|e| AttachError::Release {
            resource: "TCX link".to_string(),
            reason: e.to_string(),
        })
    }

    fn release(&mut self) -> Result<(), AttachError> {
        let mut reasons = Vec::new();
        for hook in self.role.hooks() {
            let unloaded = self
                .classifier(hook.program)
                .and_then(|program| {
                    program.unload().map_err(|e| AttachError::Release {
                        resource: hook.program.to_string(),
                        reason: e.to_string(),
                    })
                });
            if let Err(e) = unloaded {
                reasons.push(format!("{}: {}", hook.program, e));
            }
        }

        if reasons.is_empty() {
            log::debug!("Unloaded the {} programs", self.role);
            return Ok(());
        }
        Err(AttachError::Release {
            resource: format!("{} programs", self.role),
            reason: reasons.join(", "),
        })
    }
}
