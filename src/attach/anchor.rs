//! Placement of programs inside an interface's TCX chain.
//!
//! Other datapath components (a CNI's programs, usually) may already sit on
//! the hook. The operator can ask for the STAMP program to run just before or
//! just after such a reference program; when the reference cannot be found or
//! the relative attach is refused, the program is attached at the head of the
//! chain instead and the fallback is reported.

use std::{
    fmt,
    sync::{Mutex, PoisonError},
};

use clap::ValueEnum;

use super::{AttachError, AttachTarget, HookPoint, HookRuntime};

/// Default name prefix of the reference program.
pub const DEFAULT_REFERENCE_PREFIX: &str = "cil_";

/// Requested position relative to the reference program.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, ValueEnum)]
pub enum AnchorPosition {
    #[value(name = "before")]
    BeforeReference,
    #[value(name = "after")]
    AfterReference,
    #[default]
    #[value(name = "default")]
    Default,
}

impl fmt::Display for AnchorPosition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AnchorPosition::BeforeReference => write!(f, "before"),
            AnchorPosition::AfterReference => write!(f, "after"),
            AnchorPosition::Default => write!(f, "default"),
        }
    }
}

/// An already attached program used as an ordering reference.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ReferenceProgram {
    pub id: u32,
    pub name: String,
}

/// Resolved position in the chain.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Anchor {
    /// First in the chain.
    Head,
    Before(ReferenceProgram),
    After(ReferenceProgram),
}

impl Anchor {
    pub fn is_relative(&self) -> bool {
        !matches!(self, Anchor::Head)
    }
}

impl fmt::Display for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Anchor::Head => write!(f, "head"),
            Anchor::Before(p) => write!(f, "before {}#{}", p.name, p.id),
            Anchor::After(p) => write!(f, "after {}#{}", p.name, p.id),
        }
    }
}

/// Outcome of a successful attach.
#[derive(Debug)]
pub struct Attached<L> {
    pub link: L,
    pub anchor: Anchor,
    /// The requested relative position was abandoned for the head.
    pub fell_back: bool,
}

enum AttachState<L> {
    Resolving,
    Attempting(Anchor),
    FallingBack(AttachError),
    Attached(Attached<L>),
    Failed(AttachError),
}

/// Serializes attach operations and drives each through
/// resolve, attempt and fallback.
#[derive(Debug)]
pub struct AnchorManager {
    reference_prefix: String,
    lock: Mutex<()>,
}

impl Default for AnchorManager {
    fn default() -> Self {
        Self::new(DEFAULT_REFERENCE_PREFIX)
    }
}

impl AnchorManager {
    pub fn new(reference_prefix: impl Into<String>) -> Self {
        Self {
            reference_prefix: reference_prefix.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn reference_prefix(&self) -> &str {
        &self.reference_prefix
    }

    /// Attaches `hook` on `target` as close to `position` as the chain allows.
    ///
    /// # Errors
    /// Only when the attach at the head of the chain fails, either as the
    /// requested position or as the fallback.
    pub fn attach<R: HookRuntime>(
        &self,
        runtime: &mut R,
        hook: HookPoint,
        target: &AttachTarget,
        position: AnchorPosition,
    ) -> Result<Attached<R::Link>, AttachError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut state = AttachState::Resolving;
        loop {
            state = match state {
                AttachState::Resolving => self.resolve(runtime, hook, target, position),
                AttachState::Attempting(anchor) => match runtime.attach(hook, target, &anchor) {
                    Ok(link) => AttachState::Attached(Attached {
                        link,
                        anchor,
                        fell_back: false,
                    }),
                    Err(e) if anchor.is_relative() => AttachState::FallingBack(e),
                    Err(e) => AttachState::Failed(e),
                },
                AttachState::FallingBack(reason) => {
                    log::warn!(
                        "Cannot place {} {} {}* on {}: {}; attaching at the head instead",
                        hook,
                        position,
                        self.reference_prefix(),
                        target,
                        reason
                    );
                    match runtime.attach(hook, target, &Anchor::Head) {
                        Ok(link) => AttachState::Attached(Attached {
                            link,
                            anchor: Anchor::Head,
                            fell_back: true,
                        }),
                        Err(e) => AttachState::Failed(e),
                    }
                }
                AttachState::Attached(attached) => {
                    log::info!("Attached {} on {} at {}", hook, target, attached.anchor);
                    return Ok(attached);
                }
                AttachState::Failed(e) => {
                    log::error!("Cannot attach {} on {}: {}", hook, target, e);
                    return Err(e);
                }
            }
        }
    }

    fn resolve<R: HookRuntime>(
        &self,
        runtime: &R,
        hook: HookPoint,
        target: &AttachTarget,
        position: AnchorPosition,
    ) -> AttachState<R::Link> {
        let reference = match position {
            AnchorPosition::Default => return AttachState::Attempting(Anchor::Head),
            _ => runtime.find_reference(target, hook.direction, &self.reference_prefix),
        };

        match (position, reference) {
            (AnchorPosition::BeforeReference, Ok(r)) => AttachState::Attempting(Anchor::Before(r)),
            (_, Ok(r)) => AttachState::Attempting(Anchor::After(r)),
            (_, Err(e)) => AttachState::FallingBack(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attach::{Direction, Role};

    /// Runtime whose chain holds at most one reference program.
    struct ChainRuntime {
        reference: Option<ReferenceProgram>,
        refuse_relative: bool,
        refuse_head: bool,
        attempts: Vec<Anchor>,
    }

    impl ChainRuntime {
        fn new(reference: Option<&str>) -> Self {
            Self {
                reference: reference.map(|name| ReferenceProgram {
                    id: 42,
                    name: name.to_string(),
                }),
                refuse_relative: false,
                refuse_head: false,
                attempts: Vec::new(),
            }
        }
    }

    impl HookRuntime for ChainRuntime {
        type Link = Anchor;

        fn resolve_interface(&self, name: &str) -> Result<AttachTarget, AttachError> {
            Ok(AttachTarget {
                name: name.to_string(),
                index: 1,
            })
        }

        fn find_reference(
            &self,
            target: &AttachTarget,
            direction: Direction,
            prefix: &str,
        ) -> Result<ReferenceProgram, AttachError> {
            self.reference
                .clone()
                .filter(|r| r.name.starts_with(prefix))
                .ok_or_else(|| AttachError::ReferenceNotFound {
                    interface: target.name.clone(),
                    direction,
                    prefix: prefix.to_string(),
                })
        }

        fn attach(
            &mut self,
            hook: HookPoint,
            target: &AttachTarget,
            anchor: &Anchor,
        ) -> Result<Anchor, AttachError> {
            self.attempts.push(anchor.clone());
            let refused = if anchor.is_relative() {
                self.refuse_relative
            } else {
                self.refuse_head
            };
            if refused {
                return Err(AttachError::Attach {
                    hook,
                    interface: target.name.clone(),
                    reason: "refused".into(),
                });
            }
            Ok(anchor.clone())
        }

        fn detach(&mut self, _link: Anchor) -> Result<(), AttachError> {
            Ok(())
        }

        fn release(&mut self) -> Result<(), AttachError> {
            Ok(())
        }
    }

    fn eth0() -> AttachTarget {
        AttachTarget {
            name: "eth0".into(),
            index: 2,
        }
    }

    fn ingress() -> HookPoint {
        Role::Reflector.hooks()[0]
    }

    #[test]
    fn test_default_goes_to_head() {
        let mut runtime = ChainRuntime::new(Some("cil_from_netdev"));
        let attached = AnchorManager::default()
            .attach(&mut runtime, ingress(), &eth0(), AnchorPosition::Default)
            .unwrap();
        assert_eq!(attached.anchor, Anchor::Head);
        assert!(!attached.fell_back);
        assert_eq!(runtime.attempts.len(), 1);
    }

    #[test]
    fn test_before_reference_when_present() {
        let mut runtime = ChainRuntime::new(Some("cil_from_netdev"));
        let attached = AnchorManager::default()
            .attach(
                &mut runtime,
                ingress(),
                &eth0(),
                AnchorPosition::BeforeReference,
            )
            .unwrap();
        assert!(matches!(attached.anchor, Anchor::Before(ref r) if r.id == 42));
        assert!(!attached.fell_back);
    }

    #[test]
    fn test_after_reference_when_present() {
        let mut runtime = ChainRuntime::new(Some("cil_to_netdev"));
        let attached = AnchorManager::default()
            .attach(
                &mut runtime,
                ingress(),
                &eth0(),
                AnchorPosition::AfterReference,
            )
            .unwrap();
        assert!(matches!(attached.anchor, Anchor::After(ref r) if r.name == "cil_to_netdev"));
    }

    #[test]
    fn test_missing_reference_falls_back() {
        let mut runtime = ChainRuntime::new(None);
        let attached = AnchorManager::default()
            .attach(
                &mut runtime,
                ingress(),
                &eth0(),
                AnchorPosition::BeforeReference,
            )
            .unwrap();
        assert_eq!(attached.anchor, Anchor::Head);
        assert!(attached.fell_back);
        assert_eq!(runtime.attempts, vec![Anchor::Head]);
    }

    #[test]
    fn test_reference_prefix_is_configurable() {
        let mut runtime = ChainRuntime::new(Some("cil_from_netdev"));
        let attached = AnchorManager::new("calico_")
            .attach(
                &mut runtime,
                ingress(),
                &eth0(),
                AnchorPosition::AfterReference,
            )
            .unwrap();
        assert!(attached.fell_back);
    }

    #[test]
    fn test_refused_relative_attach_falls_back() {
        let mut runtime = ChainRuntime::new(Some("cil_from_netdev"));
        runtime.refuse_relative = true;
        let attached = AnchorManager::default()
            .attach(
                &mut runtime,
                ingress(),
                &eth0(),
                AnchorPosition::AfterReference,
            )
            .unwrap();
        assert!(attached.fell_back);
        assert_eq!(runtime.attempts.len(), 2);
        assert_eq!(runtime.attempts[1], Anchor::Head);
    }

    #[test]
    fn test_failed_fallback_is_fatal() {
        let mut runtime = ChainRuntime::new(None);
        runtime.refuse_head = true;
        let result = AnchorManager::default().attach(
            &mut runtime,
            ingress(),
            &eth0(),
            AnchorPosition::BeforeReference,
        );
        assert!(matches!(result, Err(AttachError::Attach { .. })));
    }

    #[test]
    fn test_failed_default_attach_is_fatal() {
        let mut runtime = ChainRuntime::new(None);
        runtime.refuse_head = true;
        let result =
            AnchorManager::default().attach(&mut runtime, ingress(), &eth0(), AnchorPosition::Default);
        assert!(result.is_err());
        assert_eq!(runtime.attempts.len(), 1);
    }
}
