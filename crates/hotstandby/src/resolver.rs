//! Startup role resolution.

use std::net::SocketAddr;

use serde::Serialize;

use crate::probe::PeerProbe;
use crate::registrar::{Degradation, DegradationKind};
use crate::role::Role;
use crate::Result;

/// What the registrar needs to know before binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub role: Role,
    pub peer_present: bool,
}

/// Validate the declared role, then look for an existing listener on `addr`.
///
/// Only an invalid role is an error, and it is raised before anything is
/// inspected. A failed inspection is logged, reported as a degradation and
/// treated as "no peer".
pub fn resolve(
    declared: &str,
    addr: SocketAddr,
    probe: &dyn PeerProbe,
) -> Result<(Resolution, Option<Degradation>)> {
    let role: Role = declared.parse()?;
    let (peer_present, degradation) = match probe.peer_present(addr) {
        Ok(present) => (present, None),
        Err(e) => {
            tracing::warn!(%role, %addr, error = %e, "peer inspection failed; assuming no peer");
            (
                false,
                Some(Degradation::new(DegradationKind::PeerInspection, &e)),
            )
        }
    };
    tracing::info!(%role, %addr, peer_present, "role resolved");
    Ok((Resolution { role, peer_present }, degradation))
}
