//! Connection selection.
//!
//! The routine that actually runs per SYN lives in the kernel
//! (`bpf/failover_select.c`). This module is its executable model: the same
//! decision expressed as a pure function over a registry snapshot. Keep the
//! two in lockstep.
//!
//! Primary always wins while it is live. Standby is used only when primary
//! is absent or dead. Nothing else is ever selected.

use std::os::fd::BorrowedFd;

use crate::registry::{ListenerRef, TargetRegistry};
use crate::role::Role;
use crate::Error;

/// One registry slot as the selector sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub listener: ListenerRef,
    /// Whether the referenced socket is still open somewhere.
    pub live: bool,
}

/// Snapshot of both registry slots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryView {
    pub primary: Option<Target>,
    pub standby: Option<Target>,
}

impl RegistryView {
    pub fn slot(&self, role: Role) -> Option<Target> {
        match role {
            Role::Primary => self.primary,
            Role::Standby => self.standby,
        }
    }

    /// Read both slots from `registry`, judging liveness with `is_live`.
    ///
    /// An unreachable registry reads as empty slots.
    pub fn capture<R, F>(registry: &R, mut is_live: F) -> Self
    where
        R: TargetRegistry + ?Sized,
        F: FnMut(ListenerRef) -> bool,
    {
        let mut read = |role: Role| match registry.get(role) {
            Ok(listener) => Some(Target {
                listener,
                live: is_live(listener),
            }),
            Err(Error::NotFound(_)) => None,
            Err(e) => {
                tracing::debug!(%role, error = %e, "registry read failed during capture");
                None
            }
        };
        let primary = read(Role::Primary);
        let standby = read(Role::Standby);
        Self { primary, standby }
    }
}

/// Outcome of one selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Route { role: Role, listener: ListenerRef },
    Reject,
}

impl Selection {
    pub fn role(&self) -> Option<Role> {
        match self {
            Selection::Route { role, .. } => Some(*role),
            Selection::Reject => None,
        }
    }
}

/// Pick the listener for a new connection.
///
/// Bounded: at most two slot reads, no loops over unbounded data.
pub fn select(view: &RegistryView) -> Selection {
    for role in Role::ALL {
        if let Some(Target { listener, live: true }) = view.slot(role) {
            return Selection::Route { role, listener };
        }
    }
    Selection::Reject
}

/// Liveness oracle for listeners held in this process: a reference is live
/// if it matches one of `open`.
pub fn live_in<'a>(open: &'a [BorrowedFd<'a>]) -> impl Fn(ListenerRef) -> bool + 'a {
    move |reference| {
        open.iter()
            .any(|fd| ListenerRef::of(*fd).map(|r| r == reference).unwrap_or(false))
    }
}
