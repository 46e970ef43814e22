//! The two roles a process can hold on the shared endpoint.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Which registry slot a process owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Standby,
}

impl Role {
    /// Every role, in selection priority order.
    pub const ALL: [Role; 2] = [Role::Primary, Role::Standby];

    /// Registry key. Must agree with the keys the kernel selector probes.
    pub fn key(self) -> u32 {
        match self {
            Role::Primary => 0,
            Role::Standby => 1,
        }
    }

    pub fn from_key(key: u32) -> Option<Role> {
        match key {
            0 => Some(Role::Primary),
            1 => Some(Role::Standby),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Standby => "standby",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("primary") {
            Ok(Role::Primary)
        } else if trimmed.eq_ignore_ascii_case("standby") {
            Ok(Role::Standby)
        } else {
            Err(Error::InvalidRole(s.to_owned()))
        }
    }
}
