//! Bring-up of a probe role: clock check, program load and attachment.

use std::{net::Ipv4Addr, path::PathBuf};

use thiserror::Error;

use crate::{
    attach::{
        tcx::{LoadError, ProgramGlobals, TcxRuntime},
        AnchorManager, AnchorPosition, AttachError, AttachmentHandle, HookRuntime, Role,
    },
    clock_readiness::{
        assess_clock, ClockAssessment, ClockError, ClockProbe, ClockRequirements,
        KernelClockProbe,
    },
    datapath::EngineConfig,
};

/// Immutable settings of one probe process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    pub role: Role,
    pub interface: String,
    pub local_addr: Ipv4Addr,
    pub port: u16,
    pub clock: ClockRequirements,
    pub anchor: AnchorPosition,
    pub anchor_reference: String,
    pub image: PathBuf,
    pub debug: bool,
}

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error(transparent)]
    Clock(#[from] ClockError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Attach(#[from] AttachError),
}

/// Packet-path view of the configuration.
pub fn engine_config(config: &ProbeConfig, clock: &ClockAssessment) -> EngineConfig {
    EngineConfig {
        local_addr: config.local_addr,
        port: config.port,
        tai_offset_ns: clock.tai_offset_ns(),
        error_estimate: clock.error_estimate(),
    }
}

/// Brings `role` up on the configured interface.
///
/// The clock is assessed before anything else; `load` is only called once it
/// passed. Hooks are attached ingress first. When an attach fails, whatever
/// was already acquired is released before the error is returned.
pub fn bring_up<R, L>(
    role: Role,
    config: &ProbeConfig,
    probe: &impl ClockProbe,
    manager: &AnchorManager,
    load: L,
) -> Result<AttachmentHandle<R>, ProbeError>
where
    R: HookRuntime,
    L: FnOnce(&EngineConfig, &ClockAssessment) -> Result<R, LoadError>,
{
    let clock = assess_clock(probe, &config.clock)?;
    let engine = engine_config(config, &clock);
    log::debug!("Engine configuration: {:?}", engine);

    let mut handle = AttachmentHandle::new(role, load(&engine, &clock)?);

    let target = match handle.runtime().resolve_interface(&config.interface) {
        Ok(target) => target,
        Err(e) => return Err(abort(handle, e)),
    };

    for hook in role.hooks() {
        match manager.attach(handle.runtime_mut(), hook, &target, config.anchor) {
            Ok(attached) => handle.adopt(hook, &target, attached),
            Err(e) => return Err(abort(handle, e)),
        }
    }

    log::info!(
        "The {} is attached to {} ({} links)",
        role,
        target,
        handle.links().count()
    );
    Ok(handle)
}

fn abort<R: HookRuntime>(handle: AttachmentHandle<R>, error: AttachError) -> ProbeError {
    if let Err(teardown) = handle.close() {
        log::warn!("Incomplete cleanup after failed bring-up: {}", teardown);
    }
    error.into()
}

fn load_role(role: Role, config: &ProbeConfig) -> Result<AttachmentHandle<TcxRuntime>, ProbeError> {
    let manager = AnchorManager::new(config.anchor_reference.clone());
    bring_up(
        role,
        config,
        &KernelClockProbe::default(),
        &manager,
        |engine, clock| {
            let globals = ProgramGlobals::new(engine, clock, config.clock.disable_tai);
            TcxRuntime::load(role, &config.image, &globals, config.debug)
        },
    )
}

/// Loads and attaches the Session-Sender programs.
pub fn load_sender(config: &ProbeConfig) -> Result<AttachmentHandle<TcxRuntime>, ProbeError> {
    load_role(Role::Sender, config)
}

/// Loads and attaches the Session-Reflector programs.
pub fn load_reflector(config: &ProbeConfig) -> Result<AttachmentHandle<TcxRuntime>, ProbeError> {
    load_role(Role::Reflector, config)
}

/// Loads the role named in `config`.
pub fn load(config: &ProbeConfig) -> Result<AttachmentHandle<TcxRuntime>, ProbeError> {
    match config.role {
        Role::Sender => load_sender(config),
        Role::Reflector => load_reflector(config),
    }
}
