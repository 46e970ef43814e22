//! Persistent role → listener table.
//!
//! The kernel form is a `REUSEPORT_SOCKARRAY` pinned on bpffs so it outlives
//! every process that writes to it. Slots are written with a socket's
//! descriptor and read back as the socket's cookie, which is also what
//! [`ListenerRef`] carries. The registry never checks whether a stored
//! socket is still open.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::role::Role;
use crate::sys;
use crate::{Error, Result};

/// Slots in a freshly created registry map.
pub const REGISTRY_MAX_ENTRIES: u32 = 128;

/// Opaque kernel identifier of a listening socket (its `SO_COOKIE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenerRef(pub u64);

impl ListenerRef {
    /// Read the reference of an open socket.
    pub fn of(socket: BorrowedFd<'_>) -> io::Result<Self> {
        sys::socket_cookie(socket).map(ListenerRef)
    }
}

impl fmt::Display for ListenerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Narrow read/write contract shared by every registry backend.
///
/// Each key is independently consistent. There is no compare-and-swap: the
/// last writer for a role wins.
pub trait TargetRegistry: Send + Sync {
    /// Overwrite `role`'s slot with `listener`, returning the reference now
    /// stored.
    fn set(&self, role: Role, listener: BorrowedFd<'_>) -> Result<ListenerRef>;

    /// The reference last stored for `role`, or [`Error::NotFound`].
    fn get(&self, role: Role) -> Result<ListenerRef>;
}

/// The sockarray pinned at a bpffs path.
#[derive(Debug)]
pub struct PinnedRegistry {
    path: PathBuf,
    map: OwnedFd,
}

impl PinnedRegistry {
    /// Open an existing pinned registry. Never creates one.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        match sys::obj_get(&path) {
            Ok(map) => Ok(Self { path, map }),
            Err(source) => Err(Error::RegistryUnavailable { path, source }),
        }
    }

    /// Open the pinned registry, creating and pinning it first if the path
    /// is empty. Losing a creation race to another process is fine: the
    /// winner's pin is opened instead.
    pub fn open_or_create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        match sys::obj_get(&path) {
            Ok(map) => return Ok(Self { path, map }),
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
            Err(source) => return Err(Error::RegistryUnavailable { path, source }),
        }

        let unavailable = |source| Error::RegistryUnavailable {
            path: path.clone(),
            source,
        };
        let map = sys::create_sockarray(REGISTRY_MAX_ENTRIES).map_err(unavailable)?;
        match sys::obj_pin(map.as_fd(), &path) {
            Ok(()) => {
                tracing::info!(path = %path.display(), "registry created and pinned");
                Ok(Self { path, map })
            }
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                drop(map);
                Self::open(path)
            }
            Err(source) => Err(unavailable(source)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsFd for PinnedRegistry {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.map.as_fd()
    }
}

impl TargetRegistry for PinnedRegistry {
    fn set(&self, role: Role, listener: BorrowedFd<'_>) -> Result<ListenerRef> {
        let unavailable = |source| Error::RegistryUnavailable {
            path: self.path.clone(),
            source,
        };
        sys::sockarray_update(self.map.as_fd(), role.key(), listener).map_err(unavailable)?;
        ListenerRef::of(listener).map_err(unavailable)
    }

    fn get(&self, role: Role) -> Result<ListenerRef> {
        match sys::sockarray_lookup(self.map.as_fd(), role.key()) {
            Ok(cookie) => Ok(ListenerRef(cookie)),
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Err(Error::NotFound(role)),
            Err(source) => Err(Error::RegistryUnavailable {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

/// A pinned registry reopened on every access.
///
/// Nothing is cached between calls: an unreachable pin reports
/// [`Error::RegistryUnavailable`] every time, and a slot cleared by the kernel
/// reports [`Error::NotFound`] on the next read.
#[derive(Debug, Clone)]
pub struct PinnedPath(pub PathBuf);

impl TargetRegistry for PinnedPath {
    fn set(&self, role: Role, listener: BorrowedFd<'_>) -> Result<ListenerRef> {
        PinnedRegistry::open(&self.0)?.set(role, listener)
    }

    fn get(&self, role: Role) -> Result<ListenerRef> {
        PinnedRegistry::open(&self.0)?.get(role)
    }
}

/// In-process registry for tests and dry runs.
///
/// Can be flipped to unavailable to exercise degraded startup paths.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    slots: Mutex<HashMap<Role, ListenerRef>>,
    unavailable: AtomicBool,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry whose every read and write fails.
    pub fn unreachable() -> Self {
        let reg = Self::default();
        reg.set_available(false);
        reg
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(Error::RegistryUnavailable {
                path: PathBuf::from("<memory>"),
                source: io::Error::new(io::ErrorKind::NotConnected, "registry marked unavailable"),
            })
        } else {
            Ok(())
        }
    }
}

impl TargetRegistry for MemoryRegistry {
    fn set(&self, role: Role, listener: BorrowedFd<'_>) -> Result<ListenerRef> {
        self.check()?;
        let reference = ListenerRef::of(listener)?;
        self.slots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(role, reference);
        Ok(reference)
    }

    fn get(&self, role: Role) -> Result<ListenerRef> {
        self.check()?;
        self.slots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&role)
            .copied()
            .ok_or(Error::NotFound(role))
    }
}
