//! High-level command implementations behind the CLI.
//!
//! Every subcommand maps to one function here. The façade is deliberately
//! continue-on-error: a failure for one server becomes a `Failed` report and
//! the remaining servers are still processed, so a wedged backend never blocks
//! stopping the frontend.

use std::time::Duration;

use anyhow::Result;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::config::Settings;
use crate::launcher::{self, LaunchMode, LaunchOutcome};
use crate::mux;
use crate::platform;
use crate::server::{sentinel_owner, ServerName};
use crate::status::{self, ServerState, ServerStatus};
use crate::store::RecordStore;
use crate::terminator::{self, StopOutcome};

/// Pause between the stop and start halves of a restart, giving the OS time
/// to release listening sockets.
const RESTART_PAUSE: Duration = Duration::from_secs(1);

/// Per-server result of a start or stop.
#[derive(Debug)]
pub enum Outcome {
    Started(u32),
    AlreadyRunning(Option<u32>),
    Stopped,
    NotRunning,
    /// Sentinel record cleared; the external terminal window stays open.
    External,
    Failed(String),
}

/// One server's outcome, tagged with its name for reporting.
#[derive(Debug)]
pub struct Report {
    pub name: ServerName,
    pub outcome: Outcome,
}

impl Report {
    fn new(name: ServerName, outcome: Outcome) -> Self {
        Self { name, outcome }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, Outcome::Failed(_))
    }
}

/// Options shared by `start` and the start half of `restart`.
#[derive(Debug, Clone, Copy)]
pub struct StartOptions {
    pub detach: bool,
    pub concurrent: bool,
    pub wait: bool,
}

/// Starts the given servers, one report each.
///
/// Concurrent mode hands every startable target to the output multiplexer and
/// blocks until that session ends; already-running servers are reported and
/// skipped so they are not spawned twice.
pub async fn start(
    settings: &Settings,
    store: &RecordStore,
    servers: &[ServerName],
    options: StartOptions,
) -> Result<Vec<Report>> {
    if options.concurrent {
        return start_concurrent(settings, store, servers).await;
    }

    let mode = if options.detach {
        LaunchMode::Detached
    } else {
        LaunchMode::Foreground
    };
    let mut reports = Vec::new();
    let mut waiting = Vec::new();
    for &name in servers {
        match launcher::launch(name, settings.recipe(name), mode, store) {
            Ok(LaunchOutcome::Started(mut started)) => {
                info!(server = %name, pid = started.pid, "started");
                if options.wait {
                    if let Some(child) = started.child.take() {
                        waiting.push((name, child));
                    }
                }
                reports.push(Report::new(name, Outcome::Started(started.pid)));
            }
            Ok(LaunchOutcome::AlreadyRunning(pid)) => {
                reports.push(Report::new(name, Outcome::AlreadyRunning(pid)));
            }
            Err(err) => {
                reports.push(Report::new(name, Outcome::Failed(format!("{:#}", err))));
            }
        }
    }

    // --wait blocks on foreground children; a detached launch has nothing to
    // wait on and the flag is ignored for it.
    for (name, mut child) in waiting {
        let status = child.wait().await;
        debug!(server = %name, ?status, "foreground server exited");
        store.delete(name);
    }
    Ok(reports)
}

async fn start_concurrent(
    settings: &Settings,
    store: &RecordStore,
    servers: &[ServerName],
) -> Result<Vec<Report>> {
    let mut reports = Vec::new();
    let mut targets = Vec::new();
    for &name in servers {
        let current = status::probe(name, settings.port(name), store);
        if current.state == ServerState::Running {
            reports.push(Report::new(name, Outcome::AlreadyRunning(current.pid)));
        } else {
            targets.push((name, settings.recipe(name).clone()));
        }
    }
    if !targets.is_empty() {
        mux::run_concurrent(targets, store).await?;
    }
    Ok(reports)
}

/// Stops the given servers, one report each. With `force` the graceful phase
/// is skipped.
pub async fn stop(
    settings: &Settings,
    store: &RecordStore,
    servers: &[ServerName],
    force: bool,
) -> Vec<Report> {
    let mut reports = Vec::new();
    for &name in servers {
        let outcome = match terminator::stop(name, settings.port(name), force, store).await {
            Ok(StopOutcome::Stopped) => Outcome::Stopped,
            Ok(StopOutcome::NotRunning) => Outcome::NotRunning,
            Ok(StopOutcome::External) => Outcome::External,
            Err(err) => Outcome::Failed(format!("{:#}", err)),
        };
        reports.push(Report::new(name, outcome));
    }
    reports
}

/// Stops and then starts the given servers. Stop reports come first; servers
/// that failed to stop are not restarted.
pub async fn restart(
    settings: &Settings,
    store: &RecordStore,
    servers: &[ServerName],
    options: StartOptions,
) -> Result<Vec<Report>> {
    let mut reports = stop(settings, store, servers, false).await;
    let startable: Vec<ServerName> = reports
        .iter()
        .filter(|report| !report.is_failure())
        .map(|report| report.name)
        .collect();
    if !startable.is_empty() {
        sleep(RESTART_PAUSE).await;
        reports.extend(start(settings, store, &startable, options).await?);
    }
    Ok(reports)
}

/// Computes the status of every server.
pub fn status(settings: &Settings, store: &RecordStore) -> Vec<ServerStatus> {
    status::status_all(settings, store)
}

/// Servers that currently report as running; the default target set for
/// `stop` when no server is named.
pub fn running(settings: &Settings, store: &RecordStore) -> Vec<ServerName> {
    status::status_all(settings, store)
        .into_iter()
        .filter(|status| status.state == ServerState::Running)
        .map(|status| status.name)
        .collect()
}

/// Result of a cleanup sweep over the record directory.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Records whose process was confirmed gone (or unreadable) and deleted.
    pub removed: Vec<ServerName>,
    /// Records kept: live processes and external-window sentinels.
    pub retained: usize,
}

/// Removes records whose process no longer exists.
///
/// Sentinel records are kept; the supervisor cannot verify an external
/// terminal window, only the operator can.
pub fn cleanup(store: &RecordStore) -> CleanupReport {
    let mut report = CleanupReport::default();
    for name in store.list() {
        match store.load(name) {
            Some(pid) if sentinel_owner(pid).is_some() => report.retained += 1,
            Some(pid) if platform::pid_alive(pid) => report.retained += 1,
            Some(pid) => {
                debug!(server = %name, pid, "removing stale record");
                store.delete(name);
                report.removed.push(name);
            }
            // Unreadable or corrupt record file: nothing it could refer to.
            None => {
                store.delete(name);
                report.removed.push(name);
            }
        }
    }
    report
}
