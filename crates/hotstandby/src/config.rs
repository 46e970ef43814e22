//! Environment-driven configuration, read once at startup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::install::{KernelSelector, DEFAULT_INSTALL_WAIT};
use crate::registrar::DEFAULT_BACKLOG;
use crate::registry::PinnedPath;

const DEFAULT_LISTEN: ([u8; 4], u16) = ([127, 0, 0, 1], 8080);
const DEFAULT_BPF_DIR: &str = "/sys/fs/bpf/tc/globals";
const DEFAULT_MAP: &str = "failover_targets";
const DEFAULT_OBJECT: &str = "./bpf/failover_select.o";
const DEFAULT_ENTRY: &str = "select_listener";
const DEFAULT_LOCK: &str = "hotstandby-selector.lock";

/// Everything every cooperating process must agree on, plus per-instance
/// naming.
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    pub listen: SocketAddr,
    pub bpf_dir: PathBuf,
    pub map_name: String,
    pub object: PathBuf,
    pub entry: String,
    pub lock_path: PathBuf,
    pub backlog: u32,
    pub install_wait: Duration,
    pub node_name: String,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl FailoverConfig {
    /// Create from environment variables. Empty values count as unset;
    /// unparseable ones fall back to the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| get(key).map(|s| s.trim().to_owned()).filter(|s| !s.is_empty());

        let listen = var("FAILOVER_LISTEN")
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(DEFAULT_LISTEN));
        let backlog = var("FAILOVER_BACKLOG")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_BACKLOG);
        let install_wait = var("FAILOVER_INSTALL_WAIT_MS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_INSTALL_WAIT);
        let node_name = var("NODE_NAME").unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".into())
        });

        Self {
            listen,
            bpf_dir: var("FAILOVER_BPF_DIR").unwrap_or_else(|| DEFAULT_BPF_DIR.into()).into(),
            map_name: var("FAILOVER_MAP").unwrap_or_else(|| DEFAULT_MAP.into()),
            object: var("FAILOVER_OBJECT").unwrap_or_else(|| DEFAULT_OBJECT.into()).into(),
            entry: var("FAILOVER_ENTRY").unwrap_or_else(|| DEFAULT_ENTRY.into()),
            lock_path: var("FAILOVER_LOCK")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_LOCK)),
            backlog,
            install_wait,
            node_name,
        }
    }

    /// Where the registry map is pinned.
    pub fn registry_path(&self) -> PathBuf {
        self.bpf_dir.join(&self.map_name)
    }

    pub fn registry(&self) -> PinnedPath {
        PinnedPath(self.registry_path())
    }

    pub fn selector(&self) -> KernelSelector {
        KernelSelector {
            artifact: self.object.clone(),
            entry: self.entry.clone(),
            registry_path: self.registry_path(),
            lock_path: self.lock_path.clone(),
            install_wait: self.install_wait,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> FailoverConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        FailoverConfig::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let c = config(&[("NODE_NAME", "n1")]);
        assert_eq!(c.listen, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(c.registry_path(), PathBuf::from("/sys/fs/bpf/tc/globals/failover_targets"));
        assert_eq!(c.entry, "select_listener");
        assert_eq!(c.backlog, DEFAULT_BACKLOG);
        assert_eq!(c.lock_path, std::env::temp_dir().join(DEFAULT_LOCK));
        assert_eq!(c.install_wait, DEFAULT_INSTALL_WAIT);
        assert_eq!(c.node_name, "n1");
    }

    #[test]
    fn overrides_and_fallbacks() {
        let c = config(&[
            ("FAILOVER_LISTEN", "0.0.0.0:9000"),
            ("FAILOVER_BPF_DIR", "/sys/fs/bpf"),
            ("FAILOVER_MAP", "targets"),
            ("FAILOVER_BACKLOG", "not-a-number"),
            ("FAILOVER_ENTRY", "  "),
        ]);
        assert_eq!(c.listen.port(), 9000);
        assert_eq!(c.registry().0, PathBuf::from("/sys/fs/bpf/targets"));
        assert_eq!(c.backlog, DEFAULT_BACKLOG);
        assert_eq!(c.entry, DEFAULT_ENTRY);
        assert!(!c.node_name.is_empty());
    }

    #[test]
    fn selector_shares_registry_path() {
        let c = config(&[
            ("FAILOVER_OBJECT", "/opt/sel.o"),
            ("FAILOVER_LOCK", "/run/x.lock"),
            ("FAILOVER_INSTALL_WAIT_MS", "250"),
        ]);
        let s = c.selector();
        assert_eq!(s.install_wait, Duration::from_millis(250));
        assert_eq!(s.artifact, PathBuf::from("/opt/sel.o"));
        assert_eq!(s.registry_path, c.registry_path());
        assert_eq!(s.lock_path, PathBuf::from("/run/x.lock"));
    }
}
