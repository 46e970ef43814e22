//! Shared listener creation, selector installation and registry publish.
//!
//! Per-process state machine:
//!
//! ```text
//! Starting → RoleResolved → SocketBound → {SelectorInstalled | SelectorSkipped}
//!          → RegistryPublished → Serving
//! ```
//!
//! Only a bind failure stops the machine (`BindFailed`). Every other failure
//! is logged, recorded as a [`Degradation`], and the process serves anyway.
//! Nothing is retried.

use std::fmt;
use std::net::SocketAddr;
use std::os::fd::{AsFd, BorrowedFd};

use serde::Serialize;
use tokio::net::{TcpListener, TcpSocket};

use crate::install::{Installation, SelectorInstaller};
use crate::probe::PeerProbe;
use crate::registry::{ListenerRef, TargetRegistry};
use crate::resolver::{self, Resolution};
use crate::role::Role;
use crate::{Error, Result};

pub const DEFAULT_BACKLOG: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Starting,
    RoleResolved,
    SocketBound,
    SelectorInstalled,
    SelectorSkipped,
    RegistryPublished,
    Serving,
    BindFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationKind {
    /// Peer presence unknown; assumed absent.
    PeerInspection,
    /// Selector not attached by this process: no failover.
    SelectorLoad,
    /// Listener not in the registry: kernel selection will not pick it.
    RegistryUnavailable,
}

/// A feature this process runs without.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Degradation {
    pub kind: DegradationKind,
    pub detail: String,
}

impl Degradation {
    pub fn new(kind: DegradationKind, cause: &Error) -> Self {
        Self {
            kind,
            detail: cause.to_string(),
        }
    }
}

impl fmt::Display for Degradation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.detail)
    }
}

/// A listener bound with `SO_REUSEPORT`, exposing its kernel handle.
#[derive(Debug)]
pub struct SharedListener {
    inner: TcpListener,
}

impl SharedListener {
    /// Bind `addr` as a member of its reuseport group.
    ///
    /// Must be called inside a tokio runtime.
    pub fn bind(addr: SocketAddr, backlog: u32) -> Result<Self> {
        let bind_err = |source| Error::Bind { addr, source };
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(bind_err)?;
        socket.set_reuseport(true).map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        let inner = socket.listen(backlog).map_err(bind_err)?;
        Ok(Self { inner })
    }

    /// The kernel reference the registry stores for this socket.
    pub fn listener_ref(&self) -> Result<ListenerRef> {
        Ok(ListenerRef::of(self.inner.as_fd())?)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    pub fn into_inner(self) -> TcpListener {
        self.inner
    }
}

impl AsFd for SharedListener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

/// What happened to the selector during startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorState {
    Installed,
    AlreadyInstalled,
    Skipped,
    Failed,
}

/// A process that made it to `Serving`.
#[derive(Debug)]
pub struct Startup {
    pub role: Role,
    pub peer_present: bool,
    pub listener: SharedListener,
    /// Set when the registry publish succeeded.
    pub published: Option<ListenerRef>,
    pub selector: SelectorState,
    pub phases: Vec<Phase>,
    pub degradations: Vec<Degradation>,
    /// Held for the process lifetime when this process is the installer.
    pub installation: Option<Installation>,
}

impl Startup {
    pub fn is_degraded(&self) -> bool {
        !self.degradations.is_empty()
    }

    pub fn report(&self) -> StartupReport {
        StartupReport {
            role: self.role,
            addr: self.listener.local_addr().ok(),
            listener: self.listener.listener_ref().ok(),
            peer_present: self.peer_present,
            published: self.published.is_some(),
            selector: self.selector,
            phases: self.phases.clone(),
            degradations: self.degradations.clone(),
        }
    }
}

/// Machine-readable summary of a startup.
#[derive(Debug, Clone, Serialize)]
pub struct StartupReport {
    pub role: Role,
    pub addr: Option<SocketAddr>,
    pub listener: Option<ListenerRef>,
    pub peer_present: bool,
    pub published: bool,
    pub selector: SelectorState,
    pub phases: Vec<Phase>,
    pub degradations: Vec<Degradation>,
}

/// Creates the shared listener and wires it into the coordination fabric.
pub struct Registrar<'a> {
    pub registry: &'a dyn TargetRegistry,
    pub installer: &'a dyn SelectorInstaller,
    pub backlog: u32,
}

impl<'a> Registrar<'a> {
    pub fn new(registry: &'a dyn TargetRegistry, installer: &'a dyn SelectorInstaller) -> Self {
        Self {
            registry,
            installer,
            backlog: DEFAULT_BACKLOG,
        }
    }

    /// Full startup: resolve the declared role, then register.
    ///
    /// An invalid role returns before any socket, lock or registry is
    /// touched.
    pub fn start(&self, declared: &str, addr: SocketAddr, probe: &dyn PeerProbe) -> Result<Startup> {
        tracing::debug!(phase = ?Phase::Starting, declared, %addr, "starting");
        let (resolution, degradation) = resolver::resolve(declared, addr, probe)?;
        let mut startup = self.register(addr, resolution)?;
        let mut phases = vec![Phase::Starting, Phase::RoleResolved];
        phases.append(&mut startup.phases);
        startup.phases = phases;
        if let Some(d) = degradation {
            startup.degradations.insert(0, d);
        }
        Ok(startup)
    }

    /// Steps after role resolution: bind, maybe install, publish.
    pub fn register(&self, addr: SocketAddr, resolution: Resolution) -> Result<Startup> {
        let Resolution { role, peer_present } = resolution;
        let mut phases = Vec::with_capacity(6);
        let mut degradations = Vec::new();

        let listener = match SharedListener::bind(addr, self.backlog) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(phase = ?Phase::BindFailed, %role, %addr, error = %e, "cannot bind shared listener");
                return Err(e);
            }
        };
        let bound = listener.local_addr().unwrap_or(addr);
        tracing::info!(%role, addr = %bound, "listening with SO_REUSEPORT");
        phases.push(Phase::SocketBound);

        let (selector, installation) = if role == Role::Primary && !peer_present {
            match self.installer.install(listener.as_fd()) {
                Ok(Installation::Attached(guard)) => {
                    (SelectorState::Installed, Some(Installation::Attached(guard)))
                }
                Ok(Installation::AlreadyInstalled) => {
                    tracing::info!(%role, "selector already attached; not installing again");
                    (SelectorState::AlreadyInstalled, None)
                }
                Err(e) => {
                    tracing::warn!(%role, error = %e, "selector not installed; failover disabled");
                    degradations.push(Degradation::new(DegradationKind::SelectorLoad, &e));
                    (SelectorState::Failed, None)
                }
            }
        } else {
            tracing::debug!(%role, peer_present, "selector install skipped");
            (SelectorState::Skipped, None)
        };
        phases.push(match selector {
            SelectorState::Installed | SelectorState::AlreadyInstalled => Phase::SelectorInstalled,
            SelectorState::Skipped | SelectorState::Failed => Phase::SelectorSkipped,
        });

        let published = match self.registry.set(role, listener.as_fd()) {
            Ok(reference) => {
                tracing::info!(%role, key = role.key(), listener = %reference, "registry updated");
                Some(reference)
            }
            Err(e) => {
                tracing::warn!(%role, error = %e, "registry publish failed; serving direct connections only");
                degradations.push(Degradation::new(DegradationKind::RegistryUnavailable, &e));
                None
            }
        };
        phases.push(Phase::RegistryPublished);
        phases.push(Phase::Serving);

        Ok(Startup {
            role,
            peer_present,
            listener,
            published,
            selector,
            phases,
            degradations,
            installation,
        })
    }
}
