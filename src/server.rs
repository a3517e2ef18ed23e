//! Server identities supervised by devrack.
//!
//! This module defines the closed set of server names, their well-known ports,
//! and the sentinel PID values reserved for servers running in externally
//! opened terminal windows.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Error};

/// The fixed set of sibling servers the supervisor manages.
///
/// Extending this set requires a default port and a launch recipe; everything
/// else (records, discovery, termination) is generic over the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerName {
    /// Application backend (HTTP API).
    Backend,
    /// Front-end dev server.
    Frontend,
    /// Optional metrics dashboard.
    Dashboard,
}

/// Sentinel PIDs recorded for servers running in an external terminal window.
///
/// These values are far above the default Linux pid_max (32768) but a
/// collision with a real PID is possible in principle on platforms with larger
/// PID spaces; sentinel records are therefore never signaled, only cleared.
const SENTINEL_BACKEND: u32 = 999_901;
const SENTINEL_FRONTEND: u32 = 999_902;
const SENTINEL_DASHBOARD: u32 = 999_903;

impl ServerName {
    /// All known server names, in display order.
    pub const ALL: [ServerName; 3] = [
        ServerName::Backend,
        ServerName::Frontend,
        ServerName::Dashboard,
    ];

    /// Stable lowercase label used for record file names and output prefixes.
    pub fn label(&self) -> &'static str {
        match self {
            ServerName::Backend => "backend",
            ServerName::Frontend => "frontend",
            ServerName::Dashboard => "dashboard",
        }
    }

    /// Well-known TCP port the server listens on by default.
    pub fn default_port(&self) -> u16 {
        match self {
            ServerName::Backend => 8080,
            ServerName::Frontend => 3000,
            ServerName::Dashboard => 8090,
        }
    }

    /// Sentinel PID meaning "running in an external terminal window".
    pub fn sentinel_pid(&self) -> u32 {
        match self {
            ServerName::Backend => SENTINEL_BACKEND,
            ServerName::Frontend => SENTINEL_FRONTEND,
            ServerName::Dashboard => SENTINEL_DASHBOARD,
        }
    }

    /// ANSI color code for this server's output prefix.
    pub fn color_code(&self) -> &'static str {
        match self {
            ServerName::Backend => "36",   // cyan
            ServerName::Frontend => "32",  // green
            ServerName::Dashboard => "35", // magenta
        }
    }
}

/// Returns the server whose sentinel PID this is, if any.
pub fn sentinel_owner(pid: u32) -> Option<ServerName> {
    ServerName::ALL.iter().copied().find(|name| name.sentinel_pid() == pid)
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ServerName {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "backend" => Ok(ServerName::Backend),
            "frontend" => Ok(ServerName::Frontend),
            "dashboard" => Ok(ServerName::Dashboard),
            other => bail!("unknown server name: {}", other),
        }
    }
}
