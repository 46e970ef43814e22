use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::role::Role;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid role {0:?}: expected \"primary\" or \"standby\"")]
    InvalidRole(String),

    #[error("bind {addr} failed: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("selector load failed: {0}")]
    SelectorLoad(String),

    #[error("selector syscall failed: {0}")]
    SelectorIo(#[source] io::Error),

    #[error("registry at {} unavailable: {source}", .path.display())]
    RegistryUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no registry entry for {0}")]
    NotFound(Role),

    #[error("peer inspection failed: {0}")]
    PeerInspection(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Only a bad role or an unusable address stops the process. Everything
    /// else degrades a feature and the instance keeps serving.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::InvalidRole(_) | Error::Bind { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
