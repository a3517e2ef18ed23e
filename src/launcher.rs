//! Starting servers as child processes.
//!
//! A launch checks the "not already running" precondition through the status
//! reporter, spawns the child with mode-specific wiring, and persists the PID
//! in the record store before returning, so a supervisor crash right after a
//! launch still leaves a recoverable record.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use tokio::process::{Child, Command};

use crate::config::RunRecipe;
use crate::platform;
use crate::server::ServerName;
use crate::status::{self, ServerState};
use crate::store::RecordStore;

/// How the child is attached to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Output connected to the supervisor's terminal; dies with it.
    Foreground,
    /// Detached from the supervisor: new session/group, stdio to null.
    Detached,
}

/// Result of a launch attempt.
#[derive(Debug)]
pub enum LaunchOutcome {
    Started(LaunchedServer),
    /// The precondition failed: a live process already serves this name.
    AlreadyRunning(Option<u32>),
}

/// A successfully started server.
#[derive(Debug)]
pub struct LaunchedServer {
    pub pid: u32,
    /// Present only for foreground launches, so the caller may wait on exit.
    pub child: Option<Child>,
}

/// Starts `name` using `recipe` in the given mode.
pub fn launch(
    name: ServerName,
    recipe: &RunRecipe,
    mode: LaunchMode,
    store: &RecordStore,
) -> Result<LaunchOutcome> {
    let current = status::probe(name, recipe.port, store);
    if current.state == ServerState::Running {
        return Ok(LaunchOutcome::AlreadyRunning(current.pid));
    }

    let program = resolve_executable(name, recipe)?;
    let mut command = base_command(&program, recipe);
    match mode {
        LaunchMode::Foreground => {
            command
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
            platform::configure_foreground(&mut command);
        }
        LaunchMode::Detached => {
            command
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            platform::configure_detached(&mut command);
        }
    }

    let child = command
        .spawn()
        .with_context(|| format!("failed to spawn {}", name))?;
    let pid = child
        .id()
        .ok_or_else(|| anyhow!("spawned {} but no PID was reported", name))?;
    store.save(name, pid);

    let child = match mode {
        LaunchMode::Foreground => Some(child),
        LaunchMode::Detached => None,
    };
    Ok(LaunchOutcome::Started(LaunchedServer { pid, child }))
}

/// Spawns `name` with piped stdout/stderr for the output multiplexer.
///
/// The precondition check is the caller's job here: concurrent targets are
/// probed up front so one busy port does not abort its siblings.
pub fn spawn_captured(name: ServerName, recipe: &RunRecipe, store: &RecordStore) -> Result<Child> {
    let program = resolve_executable(name, recipe)?;
    let mut command = base_command(&program, recipe);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command.kill_on_drop(true);
    platform::configure_foreground(&mut command);

    let child = command
        .spawn()
        .with_context(|| format!("failed to spawn {}", name))?;
    if let Some(pid) = child.id() {
        store.save(name, pid);
    }
    Ok(child)
}

fn base_command(program: &PathBuf, recipe: &RunRecipe) -> Command {
    let mut command = Command::new(program);
    command.args(&recipe.args);
    if let Some(cwd) = &recipe.cwd {
        command.current_dir(cwd);
    }
    if !recipe.env.is_empty() {
        command.envs(&recipe.env);
    }
    command
}

/// Resolves the executable for a recipe.
///
/// The front-end dev server is started through a package-runner executable
/// (npm, pnpm, ...); a missing runner is a configuration error reported before
/// anything is spawned, not a spawn failure.
fn resolve_executable(name: ServerName, recipe: &RunRecipe) -> Result<PathBuf> {
    if name == ServerName::Frontend {
        return which::which(&recipe.cmd).map_err(|_| {
            anyhow!(
                "frontend launcher '{}' not found on PATH; install it or set servers.frontend.cmd",
                recipe.cmd
            )
        });
    }
    Ok(PathBuf::from(&recipe.cmd))
}
