//! Peer inspection: is something already listening on our port?
//!
//! Reads the kernel's live socket tables rather than the registry, so a peer
//! is seen even before it has published its registry entry.
//! Format of `/proc/net/tcp{,6}` rows:
//! `sl local_address rem_address st tx_queue:rx_queue ...` with addresses as
//! host-order hex words and the port as hex.

use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;

use crate::{Error, Result};

const TCP_LISTEN: u8 = 0x0A;

/// Best-effort detection of an existing listener.
pub trait PeerProbe {
    fn peer_present(&self, addr: SocketAddr) -> Result<bool>;
}

impl<F> PeerProbe for F
where
    F: Fn(SocketAddr) -> Result<bool>,
{
    fn peer_present(&self, addr: SocketAddr) -> Result<bool> {
        self(addr)
    }
}

/// One parsed socket table row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketEntry {
    pub local: SocketAddr,
    pub state: u8,
}

impl SocketEntry {
    pub fn is_listening(&self) -> bool {
        self.state == TCP_LISTEN
    }

    /// Whether this socket occupies `addr`, counting wildcards on either side.
    pub fn covers(&self, addr: SocketAddr) -> bool {
        if self.local.port() != addr.port() {
            return false;
        }
        let (ours, theirs) = (self.local.ip(), addr.ip());
        ours.is_unspecified() || theirs.is_unspecified() || ours == theirs
    }
}

/// Scans `/proc/net/tcp` and `/proc/net/tcp6`.
#[derive(Debug, Clone)]
pub struct ProcNetProbe {
    root: PathBuf,
}

impl Default for ProcNetProbe {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/proc/net"),
        }
    }
}

impl ProcNetProbe {
    /// Probe tables under a different directory (used with fixtures).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Every parseable row of both tables. A missing `tcp6` (IPv6 disabled)
    /// is not an error; both tables missing is.
    pub fn entries(&self) -> Result<Vec<SocketEntry>> {
        let mut entries = Vec::new();
        let mut last_err: Option<io::Error> = None;
        let mut read_any = false;
        for table in ["tcp", "tcp6"] {
            match fs::read_to_string(self.root.join(table)) {
                Ok(content) => {
                    read_any = true;
                    entries.extend(content.lines().skip(1).filter_map(parse_row));
                }
                Err(e) => last_err = Some(e),
            }
        }
        match (read_any, last_err) {
            (false, Some(e)) => Err(Error::PeerInspection(e)),
            _ => Ok(entries),
        }
    }
}

impl PeerProbe for ProcNetProbe {
    fn peer_present(&self, addr: SocketAddr) -> Result<bool> {
        Ok(self
            .entries()?
            .iter()
            .any(|e| e.is_listening() && e.covers(addr)))
    }
}

fn parse_row(line: &str) -> Option<SocketEntry> {
    let mut fields = line.split_whitespace();
    let _slot = fields.next()?;
    let local = fields.next()?;
    let _remote = fields.next()?;
    let state = u8::from_str_radix(fields.next()?, 16).ok()?;
    Some(SocketEntry {
        local: parse_addr(local)?,
        state,
    })
}

fn parse_addr(field: &str) -> Option<SocketAddr> {
    let (ip_hex, port_hex) = field.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let raw = hex::decode(ip_hex).ok()?;
    // Each 32-bit word is printed as a host-order integer.
    let mut octets = Vec::with_capacity(raw.len());
    for word in raw.chunks_exact(4) {
        let value = u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
        octets.extend_from_slice(&value.to_ne_bytes());
    }
    let ip = match octets.len() {
        4 => IpAddr::V4(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3])),
        16 => {
            let mut b = [0u8; 16];
            b.copy_from_slice(&octets);
            IpAddr::V6(Ipv6Addr::from(b))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}
