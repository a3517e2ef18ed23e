//! Stopping servers: graceful first, forced after a bounded wait.
//!
//! The PID to signal is resolved from the record store first and the port
//! locator second. Termination is two-phase: a graceful request, a bounded
//! wait polling liveness, then an unconditional kill — with the OS-native
//! force-kill utility as the fallback when direct signaling is denied or
//! unavailable. A target that is already gone counts as a successful stop.

use std::io;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::locator::{self, PortOwner};
use crate::platform;
use crate::server::{sentinel_owner, ServerName};
use crate::store::RecordStore;

/// Bounded wait after the graceful termination request.
const GRACEFUL_WAIT: Duration = Duration::from_secs(5);
/// Wait after the forced kill before declaring failure.
const KILL_WAIT: Duration = Duration::from_secs(2);
/// Liveness poll interval during both waits.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Result of a stop attempt. Termination failures surface as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process was confirmed dead and its record removed.
    Stopped,
    /// Nothing to stop: no record, no port owner.
    NotRunning,
    /// The record was a sentinel for an external terminal window; it was
    /// cleared, but the window must be closed manually.
    External,
}

/// Stops `name`, escalating from graceful to forced termination.
///
/// With `force` the graceful phase is skipped entirely. The record is deleted
/// only once the process is confirmed dead; if the process survives
/// escalation the record is deliberately kept and an error is returned so the
/// operator is not misled into thinking the server is down.
pub async fn stop(
    name: ServerName,
    port: u16,
    force: bool,
    store: &RecordStore,
) -> Result<StopOutcome> {
    let recorded = store.load(name);
    if let Some(pid) = recorded {
        if sentinel_owner(pid).is_some() {
            store.delete(name);
            return Ok(StopOutcome::External);
        }
    }

    let (pid, had_record) = match recorded {
        Some(pid) => (pid, true),
        None => match locator::find_owner_of_port(port) {
            PortOwner::Owner(pid) => (pid, false),
            PortOwner::Busy => {
                bail!(
                    "port {} is in use but its owning process could not be identified",
                    port
                );
            }
            PortOwner::Free | PortOwner::Unknown => return Ok(StopOutcome::NotRunning),
        },
    };

    if !platform::pid_alive(pid) {
        // Already gone: an idempotent success, not an error.
        store.delete(name);
        return Ok(if had_record {
            StopOutcome::Stopped
        } else {
            StopOutcome::NotRunning
        });
    }

    if !force {
        match platform::send_terminate(pid) {
            Ok(()) => {
                if wait_for_death(pid, GRACEFUL_WAIT).await {
                    store.delete(name);
                    return Ok(StopOutcome::Stopped);
                }
                debug!(server = %name, pid, "graceful wait expired, escalating");
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                store.delete(name);
                return Ok(StopOutcome::Stopped);
            }
            Err(err) => {
                warn!(server = %name, pid, error = %err, "graceful signal failed, escalating");
            }
        }
    }

    match platform::send_kill(pid) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            store.delete(name);
            return Ok(StopOutcome::Stopped);
        }
        Err(err) => {
            // Permission denied or unsupported: fall back to the external
            // force-kill utility.
            debug!(server = %name, pid, error = %err, "direct kill failed, using native force-kill");
            platform::native_force_kill(pid)
                .await
                .with_context(|| format!("failed to force-kill {} (pid {})", name, pid))?;
        }
    }

    if wait_for_death(pid, KILL_WAIT).await {
        store.delete(name);
        return Ok(StopOutcome::Stopped);
    }

    // Record is kept on purpose: the server is still up.
    bail!("{} (pid {}) is still alive after forced termination", name, pid)
}

/// Polls liveness until the process dies or the timeout expires.
async fn wait_for_death(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !platform::pid_alive(pid) {
            return true;
        }
        sleep(POLL_INTERVAL).await;
    }
    !platform::pid_alive(pid)
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
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn stop_with_nothing_to_stop_is_not_running() {
        let (_dir, store) = store();
        for name in ServerName::ALL {
            let outcome = stop(name, free_port(), false, &store).await.unwrap();
            assert_eq!(outcome, StopOutcome::NotRunning);
        }
    }

    #[tokio::test]
    async fn stale_record_counts_as_stopped() {
        let (_dir, store) = store();
        store.save(ServerName::Backend, 999_999_998);
        let outcome = stop(ServerName::Backend, free_port(), false, &store)
            .await
            .unwrap();
        assert_eq!(outcome, StopOutcome::Stopped);
        assert_eq!(store.load(ServerName::Backend), None);
    }

    #[tokio::test]
    async fn sentinel_record_is_cleared_not_signaled() {
        let (_dir, store) = store();
        store.save(ServerName::Dashboard, ServerName::Dashboard.sentinel_pid());
        let outcome = stop(ServerName::Dashboard, free_port(), false, &store)
            .await
            .unwrap();
        assert_eq!(outcome, StopOutcome::External);
        assert_eq!(store.load(ServerName::Dashboard), None);
    }

    /// Spawns a shell command and hands its reaping to a background task, the
    /// way a real stop target is reaped by its own parent: without this a
    /// killed test child lingers as a zombie and still probes as alive.
    #[cfg(unix)]
    fn spawn_target(script: &str) -> (u32, tokio::task::JoinHandle<()>) {
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", script])
            .spawn()
            .expect("failed to spawn test target");
        let pid = child.id().unwrap();
        let reaper = tokio::spawn(async move {
            let _ = child.wait().await;
        });
        (pid, reaper)
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn graceful_stop_terminates_recorded_process() {
        let (_dir, store) = store();
        let (pid, reaper) = spawn_target("exec sleep 30");
        store.save(ServerName::Backend, pid);

        let outcome = stop(ServerName::Backend, free_port(), false, &store)
            .await
            .unwrap();
        assert_eq!(outcome, StopOutcome::Stopped);
        assert_eq!(store.load(ServerName::Backend), None);

        reaper.await.unwrap();
        assert!(!platform::pid_alive(pid));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn stop_escalates_when_graceful_signal_is_ignored() {
        let (_dir, store) = store();
        // The ignored-TERM disposition survives exec, so the target must be
        // force-killed.
        let (pid, reaper) = spawn_target("trap '' TERM; exec sleep 30");
        store.save(ServerName::Frontend, pid);

        let outcome = stop(ServerName::Frontend, free_port(), false, &store)
            .await
            .unwrap();
        assert_eq!(outcome, StopOutcome::Stopped);
        assert_eq!(store.load(ServerName::Frontend), None);

        reaper.await.unwrap();
        assert!(!platform::pid_alive(pid));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn force_stop_skips_the_graceful_phase() {
        let (_dir, store) = store();
        let (pid, reaper) = spawn_target("exec sleep 30");
        store.save(ServerName::Backend, pid);

        let started = std::time::Instant::now();
        let outcome = stop(ServerName::Backend, free_port(), true, &store)
            .await
            .unwrap();
        assert_eq!(outcome, StopOutcome::Stopped);
        // No 5-second graceful wait in the forced path.
        assert!(started.elapsed() < GRACEFUL_WAIT);

        reaper.await.unwrap();
    }
}
