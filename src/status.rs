//! Status reconciliation between the record store and live process state.
//!
//! The two-tier check (recorded PID liveness, then port discovery with
//! self-healing) is what lets the supervisor recover from manual kills,
//! machine restarts, and records left behind by crashed supervisor instances
//! without an explicit repair step.

use tracing::debug;

use crate::config::Settings;
use crate::locator::{self, PortOwner};
use crate::platform;
use crate::server::{sentinel_owner, ServerName};
use crate::store::RecordStore;

/// Normalized state reported for a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Running,
    Stopped,
    /// A probe or locator error prevented a definite answer.
    Unknown,
}

/// A derived, non-persisted view of one server.
#[derive(Debug, Clone, Copy)]
pub struct ServerStatus {
    pub name: ServerName,
    pub state: ServerState,
    pub pid: Option<u32>,
    /// The record is a sentinel for an externally opened terminal window.
    pub external: bool,
}

/// Computes the status of a single server.
///
/// Algorithm: recorded PID that passes a liveness probe wins; a dead or absent
/// record falls through to the port locator, and a discovered owner is written
/// back to the store so subsequent lookups are plain record reads.
pub fn probe(name: ServerName, port: u16, store: &RecordStore) -> ServerStatus {
    if let Some(pid) = store.load(name) {
        if sentinel_owner(pid).is_some() {
            return ServerStatus {
                name,
                state: ServerState::Running,
                pid: None,
                external: true,
            };
        }
        if platform::pid_alive(pid) {
            return ServerStatus {
                name,
                state: ServerState::Running,
                pid: Some(pid),
                external: false,
            };
        }
        debug!(server = %name, pid, "recorded PID is dead, falling back to port discovery");
    }

    let (state, pid) = match locator::find_owner_of_port(port) {
        PortOwner::Owner(pid) => {
            // Self-heal: the record was missing or stale.
            store.save(name, pid);
            (ServerState::Running, Some(pid))
        }
        PortOwner::Busy => (ServerState::Running, None),
        PortOwner::Free => (ServerState::Stopped, None),
        PortOwner::Unknown => (ServerState::Unknown, None),
    };
    ServerStatus {
        name,
        state,
        pid,
        external: false,
    }
}

/// Computes the status of every known server.
pub fn status_all(settings: &Settings, store: &RecordStore) -> Vec<ServerStatus> {
    ServerName::ALL
        .into_iter()
        .map(|name| probe(name, settings.port(name), store))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener};
    use tempfile::TempDir;

    fn store() -> (TempDir, RecordStore) {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(dir.path().to_path_buf());
        (dir, store)
    }

    fn free_port() -> u16 {
        // Bind to an ephemeral port and release it immediately.
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[test]
    fn live_recorded_pid_reports_running() {
        let (_dir, store) = store();
        store.save(ServerName::Backend, std::process::id());
        let status = probe(ServerName::Backend, free_port(), &store);
        assert_eq!(status.state, ServerState::Running);
        assert_eq!(status.pid, Some(std::process::id()));
        assert!(!status.external);
    }

    #[test]
    fn dead_record_and_free_port_reports_stopped() {
        let (_dir, store) = store();
        store.save(ServerName::Backend, 999_999_998);
        let status = probe(ServerName::Backend, free_port(), &store);
        assert_eq!(status.state, ServerState::Stopped);
        assert_eq!(status.pid, None);
    }

    #[test]
    fn sentinel_record_reports_external_window() {
        let (_dir, store) = store();
        store.save(ServerName::Frontend, ServerName::Frontend.sentinel_pid());
        let status = probe(ServerName::Frontend, free_port(), &store);
        assert_eq!(status.state, ServerState::Running);
        assert_eq!(status.pid, None);
        assert!(status.external);
    }

    #[test]
    fn missing_record_with_live_listener_self_heals() {
        let (_dir, store) = store();
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let status = probe(ServerName::Backend, port, &store);
        assert_eq!(status.state, ServerState::Running);
        if let Some(pid) = status.pid {
            // A PID-yielding strategy found us; the record must be healed.
            assert_eq!(pid, std::process::id());
            assert_eq!(store.load(ServerName::Backend), Some(pid));
        }
    }

    #[test]
    fn no_record_no_listener_reports_stopped() {
        let (_dir, store) = store();
        let status = probe(ServerName::Dashboard, free_port(), &store);
        assert_eq!(status.state, ServerState::Stopped);
    }
}
