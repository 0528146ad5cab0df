//! Attachment of the STAMP programs to an interface's TCX hooks.
//!
//! The hook infrastructure is reached through [`HookRuntime`]; the kernel
//! implementation lives in [`tcx`]. [`anchor::AnchorManager`] decides where in
//! the TCX chain a program goes, and [`AttachmentHandle`] owns everything that
//! was acquired for one role until it is closed.

use std::fmt;

use clap::ValueEnum;
use thiserror::Error;

pub mod anchor;
pub mod tcx;

pub use anchor::{Anchor, AnchorManager, AnchorPosition, Attached, ReferenceProgram};

/// Probe role; selects the program pair that gets attached.
#[derive(Copy, Clone, PartialEq, Eq, Debug, ValueEnum)]
pub enum Role {
    /// Session-Sender.
    #[value(name = "sender")]
    Sender,
    /// Session-Reflector.
    #[value(name = "reflector")]
    Reflector,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Role::Sender => write!(f, "sender"),
            Role::Reflector => write!(f, "reflector"),
        }
    }
}

impl Role {
    /// Hooks of the role, in bring-up order.
    pub fn hooks(self) -> [HookPoint; 2] {
        match self {
            Role::Sender => [
                HookPoint::new("sender_in", Direction::Ingress),
                HookPoint::new("sender_out", Direction::Egress),
            ],
            Role::Reflector => [
                HookPoint::new("reflector_in", Direction::Ingress),
                HookPoint::new("reflector_out", Direction::Egress),
            ],
        }
    }
}

/// Traffic direction of a TCX hook.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum Direction {
    Ingress,
    Egress,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::Ingress => write!(f, "ingress"),
            Direction::Egress => write!(f, "egress"),
        }
    }
}

/// A program of the image and the hook it belongs on.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct HookPoint {
    pub program: &'static str,
    pub direction: Direction,
}

impl HookPoint {
    pub const fn new(program: &'static str, direction: Direction) -> Self {
        Self { program, direction }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.program, self.direction)
    }
}

/// Interface the programs are attached to.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AttachTarget {
    pub name: String,
    pub index: u32,
}

impl fmt::Display for AttachTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.index)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttachError {
    #[error("Interface {0} not found")]
    InterfaceNotFound(String),
    #[error("No program named {prefix}* on {interface} {direction}")]
    ReferenceNotFound {
        interface: String,
        direction: Direction,
        prefix: String,
    },
    #[error("Program {0} not present in the loaded image")]
    ProgramNotFound(String),
    #[error("Failed to attach {hook} to {interface}: {reason}")]
    Attach {
        hook: HookPoint,
        interface: String,
        reason: String,
    },
    #[error("Failed to release {resource}: {reason}")]
    Release { resource: String, reason: String },
}

/// Hook infrastructure used by the control plane.
///
/// A runtime owns one loaded program image. Links it hands out stay valid
/// until passed back to [`HookRuntime::detach`].
pub trait HookRuntime {
    type Link;

    /// Resolves an interface name to its index.
    fn resolve_interface(&self, name: &str) -> Result<AttachTarget, AttachError>;

    /// Looks for an already attached program whose name starts with `prefix`.
    fn find_reference(
        &self,
        target: &AttachTarget,
        direction: Direction,
        prefix: &str,
    ) -> Result<ReferenceProgram, AttachError>;

    /// Attaches `hook` at `anchor`.
    fn attach(
        &mut self,
        hook: HookPoint,
        target: &AttachTarget,
        anchor: &Anchor,
    ) -> Result<Self::Link, AttachError>;

    fn detach(&mut self, link: Self::Link) -> Result<(), AttachError>;

    /// Releases the program image. Called once, after every link is detached.
    fn release(&mut self) -> Result<(), AttachError>;
}

/// Description of one held link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkInfo {
    pub hook: HookPoint,
    pub interface: String,
    pub anchor: String,
    pub fell_back: bool,
}

impl fmt::Display for LinkInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} on {} at {}", self.hook, self.interface, self.anchor)
    }
}

/// One resource that could not be released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseFailure {
    pub resource: String,
    pub error: AttachError,
}

/// Every failure met while closing a handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to release {} resource(s) of the {role}: {}", .failures.len(), describe(.failures))]
pub struct TeardownError {
    pub role: Role,
    pub failures: Vec<ReleaseFailure>,
}

fn describe(failures: &[ReleaseFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.resource, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Owns the links and the program image of one role.
///
/// Closing releases every link and then the image, carrying on past failures.
/// A handle dropped without [`close`](AttachmentHandle::close) is torn down the
/// same way and its failures are logged.
pub struct AttachmentHandle<R: HookRuntime> {
    role: Role,
    runtime: R,
    links: Vec<(LinkInfo, R::Link)>,
    released: bool,
}

impl<R: HookRuntime> AttachmentHandle<R> {
    pub fn new(role: Role, runtime: R) -> Self {
        Self {
            role,
            runtime,
            links: Vec::new(),
            released: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut R {
        &mut self.runtime
    }

    /// Takes ownership of a fresh attachment.
    pub fn adopt(&mut self, hook: HookPoint, target: &AttachTarget, attached: Attached<R::Link>) {
        let info = LinkInfo {
            hook,
            interface: target.name.clone(),
            anchor: attached.anchor.to_string(),
            fell_back: attached.fell_back,
        };
        self.links.push((info, attached.link));
    }

    pub fn links(&self) -> impl Iterator<Item = &LinkInfo> {
        self.links.iter().map(|(info, _)| info)
    }

    /// Detaches every link and releases the image.
    ///
    /// # Errors
    /// A [`TeardownError`] listing every resource that failed to release;
    /// the remaining resources are released regardless.
    pub fn close(mut self) -> Result<(), TeardownError> {
        let failures = self.teardown();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(TeardownError {
                role: self.role,
                failures,
            })
        }
    }

    fn teardown(&mut self) -> Vec<ReleaseFailure> {
        let mut failures = Vec::new();

        // Reverse bring-up order.
        while let Some((info, link)) = self.links.pop() {
            match self.runtime.detach(link) {
                Ok(()) => log::debug!("Detached {}", info),
                Err(error) => {
                    log::warn!("Cannot detach {}: {}", info, error);
                    failures.push(ReleaseFailure {
                        resource: info.to_string(),
                        error,
                    });
                }
            }
        }

        if !self.released {
            self.released = true;
            if let Err(error) = self.runtime.release() {
                log::warn!("Cannot release the {} program image: {}", self.role, error);
                failures.push(ReleaseFailure {
                    resource: format!("{} program image", self.role),
                    error,
                });
            }
        }

        failures
    }
}

impl<R: HookRuntime> Drop for AttachmentHandle<R> {
    fn drop(&mut self) {
        let failures = self.teardown();
        if !failures.is_empty() {
            log::error!(
                "{}",
                TeardownError {
                    role: self.role,
                    failures,
                }
            );
        }
    }
}

impl<R: HookRuntime> fmt::Debug for AttachmentHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AttachmentHandle")
            .field("role", &self.role)
            .field("links", &self.links().collect::<Vec<_>>())
            .field("released", &self.released)
            .finish()
    }
}
