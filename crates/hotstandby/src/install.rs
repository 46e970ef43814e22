//! One-time installation of the selector on the shared socket group.
//!
//! The selector belongs to the reuseport group, not to a process, so it must
//! be attached once. Peer inspection narrows who tries; the install lock
//! decides who tries to load. Whoever holds the lock is the installer, and
//! keeps holding it until exit. Once its attach succeeds it writes its pid
//! into the lock file. Another primary finding the lock held waits a bounded
//! time for that mark: a live marked holder means the selector is in place,
//! which is reported as success. A released lock is taken over; a holder
//! that never marks is a load failure.

use std::any::Any;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::artifact::SelectorProgram;
use crate::registry::PinnedRegistry;
use crate::sys;
use crate::{Error, Result};

/// Keeps an installation alive. Dropping it gives up the installer claim
/// (the kernel keeps the program attached for as long as the group exists).
pub struct InstallGuard {
    _hold: Box<dyn Any + Send + Sync>,
}

impl InstallGuard {
    fn new(hold: impl Any + Send + Sync) -> Self {
        Self {
            _hold: Box::new(hold),
        }
    }
}

impl fmt::Debug for InstallGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallGuard").finish_non_exhaustive()
    }
}

/// Result of an install attempt that did not fail.
#[derive(Debug)]
pub enum Installation {
    /// This process attached the selector.
    Attached(InstallGuard),
    /// A live process already did.
    AlreadyInstalled,
}

impl Installation {
    pub fn attached(&self) -> bool {
        matches!(self, Installation::Attached(_))
    }
}

/// Attaches the selector to the group `socket` belongs to.
pub trait SelectorInstaller: Send + Sync {
    fn install(&self, socket: BorrowedFd<'_>) -> Result<Installation>;
}

/// How long a primary waits for a held install lock to be marked attached.
pub const DEFAULT_INSTALL_WAIT: Duration = Duration::from_secs(2);
const INSTALL_POLL: Duration = Duration::from_millis(20);

/// Exclusive `flock` on the install lock file, held for the owner's
/// lifetime. The kernel drops it when the owning process exits.
///
/// The file body is empty until [`InstallLock::mark_attached`], then holds
/// the owner's pid.
#[derive(Debug)]
pub struct InstallLock {
    file: File,
    path: PathBuf,
}

impl InstallLock {
    /// `Ok(None)` when another holder has it.
    pub fn try_acquire(path: &Path) -> io::Result<Option<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if sys::try_lock_exclusive(&file)? {
            // A previous owner may have died after marking.
            file.set_len(0)?;
            Ok(Some(Self {
                file,
                path: path.to_owned(),
            }))
        } else {
            Ok(None)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record that this owner's selector is attached.
    pub fn mark_attached(&self) -> io::Result<()> {
        self.file.set_len(0)?;
        self.file
            .write_all_at(format!("{}\n", std::process::id()).as_bytes(), 0)
    }

    /// Whether the lock file at `path` carries the mark of a live process.
    pub fn marked_attached(path: &Path) -> bool {
        fs::read_to_string(path)
            .ok()
            .and_then(|body| body.trim().parse::<libc::pid_t>().ok())
            .map(sys::process_alive)
            .unwrap_or(false)
    }
}

impl Drop for InstallLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
    }
}

impl AsFd for InstallLock {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

/// Loads the compiled selector and attaches it with
/// `SO_ATTACH_REUSEPORT_EBPF`.
#[derive(Debug, Clone)]
pub struct KernelSelector {
    pub artifact: PathBuf,
    pub entry: String,
    pub registry_path: PathBuf,
    pub lock_path: PathBuf,
    /// Bound on waiting for another holder of the lock to finish attaching.
    pub install_wait: Duration,
}

struct KernelHold {
    _lock: InstallLock,
    _prog: std::os::fd::OwnedFd,
    _registry: PinnedRegistry,
}

impl SelectorInstaller for KernelSelector {
    fn install(&self, socket: BorrowedFd<'_>) -> Result<Installation> {
        let lock = match self.acquire_or_confirm()? {
            Some(lock) => lock,
            None => return Ok(Installation::AlreadyInstalled),
        };

        let registry = PinnedRegistry::open_or_create(&self.registry_path)
            .map_err(|e| Error::SelectorLoad(format!("registry map: {e}")))?;
        let mut program = SelectorProgram::read(&self.artifact, &self.entry)?;
        program.bind_map(registry.as_fd());
        let prog = program.load()?;
        sys::attach_reuseport_prog(socket, prog.as_fd()).map_err(Error::SelectorIo)?;
        if let Err(e) = lock.mark_attached() {
            tracing::warn!(lock = %self.lock_path.display(), error = %e, "cannot mark selector attached; other primaries will report it missing");
        }

        tracing::info!(
            artifact = %self.artifact.display(),
            entry = %self.entry,
            registry = %registry.path().display(),
            "selector attached to reuseport group"
        );
        Ok(Installation::Attached(InstallGuard::new(KernelHold {
            _lock: lock,
            _prog: prog,
            _registry: registry,
        })))
    }
}

impl KernelSelector {
    /// Take the install lock, or confirm that its live holder has attached.
    ///
    /// `Ok(None)` means the selector is already in place.
    fn acquire_or_confirm(&self) -> Result<Option<InstallLock>> {
        let lock_error = |e: io::Error| {
            Error::SelectorLoad(format!("install lock {}: {e}", self.lock_path.display()))
        };
        let deadline = Instant::now() + self.install_wait;
        loop {
            if let Some(lock) = InstallLock::try_acquire(&self.lock_path).map_err(lock_error)? {
                return Ok(Some(lock));
            }
            if InstallLock::marked_attached(&self.lock_path) {
                tracing::info!(lock = %self.lock_path.display(), "selector already installed by a live process");
                return Ok(None);
            }
            if Instant::now() >= deadline {
                return Err(Error::SelectorLoad(format!(
                    "install lock {} held for {:?} without an attached selector",
                    self.lock_path.display(),
                    self.install_wait
                )));
            }
            thread::sleep(INSTALL_POLL);
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    claimed: Mutex<bool>,
    attaches: AtomicUsize,
}

struct MemoryClaim(Arc<MemoryState>);

impl Drop for MemoryClaim {
    fn drop(&mut self) {
        *self.0.claimed.lock().unwrap_or_else(|p| p.into_inner()) = false;
    }
}

/// In-process stand-in for the kernel side. Clones share one socket group.
#[derive(Debug, Clone, Default)]
pub struct MemorySelector {
    state: Arc<MemoryState>,
    failure: Option<String>,
}

impl MemorySelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// An installer whose every attempt fails to load, as with a missing
    /// artifact.
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            state: Arc::default(),
            failure: Some(reason.into()),
        }
    }

    /// Total successful attaches across every clone.
    pub fn attach_count(&self) -> usize {
        self.state.attaches.load(Ordering::SeqCst)
    }

    pub fn is_installed(&self) -> bool {
        *self.state.claimed.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl SelectorInstaller for MemorySelector {
    fn install(&self, _socket: BorrowedFd<'_>) -> Result<Installation> {
        if let Some(reason) = &self.failure {
            return Err(Error::SelectorLoad(reason.clone()));
        }
        let mut claimed = self.state.claimed.lock().unwrap_or_else(|p| p.into_inner());
        if *claimed {
            return Ok(Installation::AlreadyInstalled);
        }
        *claimed = true;
        self.state.attaches.fetch_add(1, Ordering::SeqCst);
        Ok(Installation::Attached(InstallGuard::new(MemoryClaim(
            self.state.clone(),
        ))))
    }
}
