//! Devrack: a supervisor for the local development servers.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, loads configuration, and dispatches to the supervisor façade,
//! printing one result line per server.

mod config;
mod launcher;
mod locator;
mod mux;
mod platform;
mod server;
mod status;
mod store;
mod supervisor;
mod terminator;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::Settings;
use crate::server::ServerName;
use crate::status::ServerState;
use crate::store::RecordStore;
use crate::supervisor::{Outcome, Report, StartOptions};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "devrack",
    version,
    about = "Supervise the local development servers",
    styles = help_styles()
)]
struct Cli {
    /// Path to devrack.toml (defaults to ./devrack.toml when present).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start servers (backend and frontend when none is named).
    Start(StartArgs),
    /// Stop servers (the running ones when none is named).
    Stop(StopArgs),
    /// Stop and then start servers.
    Restart(StartArgs),
    /// Show the state of every server.
    Status,
    /// Remove process records whose process is gone.
    Cleanup,
}

#[derive(Debug, Args)]
struct StartArgs {
    #[command(flatten)]
    select: ServerSelect,
    /// Override the backend port.
    #[arg(long, value_name = "PORT")]
    backend_port: Option<u16>,
    /// Override the frontend port.
    #[arg(long, value_name = "PORT")]
    frontend_port: Option<u16>,
    /// Override the dashboard port.
    #[arg(long, value_name = "PORT")]
    dashboard_port: Option<u16>,
    /// Detach servers from this terminal so they survive it.
    #[arg(long)]
    detach: bool,
    /// Run every target in this terminal with merged, prefixed output.
    #[arg(long, conflicts_with = "detach")]
    concurrent: bool,
    /// Block until foreground servers exit.
    #[arg(long, conflicts_with = "detach")]
    wait: bool,
}

#[derive(Debug, Args)]
struct StopArgs {
    #[command(flatten)]
    select: ServerSelect,
    /// Stop every known server, not just the running ones.
    #[arg(long)]
    all: bool,
    /// Skip the graceful phase and kill immediately.
    #[arg(long)]
    force: bool,
}

/// Per-server selection flags shared by start and stop.
#[derive(Debug, Args)]
struct ServerSelect {
    /// Target the backend server.
    #[arg(long)]
    backend: bool,
    /// Target the frontend dev server.
    #[arg(long)]
    frontend: bool,
    /// Target the dashboard server.
    #[arg(long)]
    dashboard: bool,
}

impl ServerSelect {
    /// Explicitly named servers, in display order. Empty means "no selection".
    fn named(&self) -> Vec<ServerName> {
        let mut servers = Vec::new();
        if self.backend {
            servers.push(ServerName::Backend);
        }
        if self.frontend {
            servers.push(ServerName::Frontend);
        }
        if self.dashboard {
            servers.push(ServerName::Dashboard);
        }
        servers
    }

    /// Named servers, or the backend+frontend pair when none is named; the
    /// dashboard is optional and only started on request.
    fn named_or_default(&self) -> Vec<ServerName> {
        let named = self.named();
        if named.is_empty() {
            vec![ServerName::Backend, ServerName::Frontend]
        } else {
            named
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

/// Dispatches one CLI invocation. Returns whether every server succeeded.
async fn run(cli: Cli) -> Result<bool> {
    let config = match cli.config.or_else(config::default_config_path) {
        Some(path) => config::load_config(&path)?,
        None => config::Config::default(),
    };

    let port_overrides = match &cli.command {
        Commands::Start(args) | Commands::Restart(args) => port_overrides(args),
        _ => Vec::new(),
    };
    let settings = Settings::resolve(config, &port_overrides).context("invalid configuration")?;
    let store = RecordStore::new(settings.state_dir.clone());

    match cli.command {
        Commands::Start(args) => {
            let servers = args.select.named_or_default();
            let reports =
                supervisor::start(&settings, &store, &servers, start_options(&args)).await?;
            Ok(print_reports(&reports))
        }
        Commands::Stop(args) => {
            let servers = if args.all {
                ServerName::ALL.to_vec()
            } else {
                let named = args.select.named();
                if named.is_empty() {
                    supervisor::running(&settings, &store)
                } else {
                    named
                }
            };
            if servers.is_empty() {
                println!("nothing to stop");
                return Ok(true);
            }
            let reports = supervisor::stop(&settings, &store, &servers, args.force).await;
            Ok(print_reports(&reports))
        }
        Commands::Restart(args) => {
            let servers = args.select.named_or_default();
            let reports =
                supervisor::restart(&settings, &store, &servers, start_options(&args)).await?;
            Ok(print_reports(&reports))
        }
        Commands::Status => {
            for status in supervisor::status(&settings, &store) {
                print_status(&status, settings.port(status.name));
            }
            Ok(true)
        }
        Commands::Cleanup => {
            let report = supervisor::cleanup(&store);
            for name in &report.removed {
                println!("{}: removed stale record", name);
            }
            println!(
                "cleanup: {} removed, {} retained",
                report.removed.len(),
                report.retained
            );
            Ok(true)
        }
    }
}

fn start_options(args: &StartArgs) -> StartOptions {
    StartOptions {
        detach: args.detach,
        concurrent: args.concurrent,
        wait: args.wait,
    }
}

fn port_overrides(args: &StartArgs) -> Vec<(ServerName, u16)> {
    let mut overrides = Vec::new();
    if let Some(port) = args.backend_port {
        overrides.push((ServerName::Backend, port));
    }
    if let Some(port) = args.frontend_port {
        overrides.push((ServerName::Frontend, port));
    }
    if let Some(port) = args.dashboard_port {
        overrides.push((ServerName::Dashboard, port));
    }
    overrides
}

/// Prints one line per report; returns whether all of them succeeded.
fn print_reports(reports: &[Report]) -> bool {
    let mut all_ok = true;
    for report in reports {
        match &report.outcome {
            Outcome::Started(pid) => println!("{}: started (pid {})", report.name, pid),
            Outcome::AlreadyRunning(Some(pid)) => {
                println!("{}: already running (pid {})", report.name, pid)
            }
            Outcome::AlreadyRunning(None) => println!("{}: already running", report.name),
            Outcome::Stopped => println!("{}: stopped", report.name),
            Outcome::NotRunning => println!("{}: not running", report.name),
            Outcome::External => println!(
                "{}: record cleared; close its terminal window manually",
                report.name
            ),
            Outcome::Failed(message) => {
                all_ok = false;
                eprintln!("{}: failed: {}", report.name, message);
            }
        }
    }
    all_ok
}

fn print_status(status: &crate::status::ServerStatus, port: u16) {
    let state = match status.state {
        ServerState::Running => "running",
        ServerState::Stopped => "stopped",
        ServerState::Unknown => "unknown",
    };
    let detail = if status.external {
        "  (external terminal)".to_string()
    } else if let Some(pid) = status.pid {
        format!("  pid {}", pid)
    } else {
        String::new()
    };
    println!("{:<10} {:<8} port {}{}", status.name, state, port, detail);
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("devrack=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_selection_preserves_display_order() {
        let select = ServerSelect {
            backend: false,
            frontend: true,
            dashboard: true,
        };
        assert_eq!(
            select.named(),
            vec![ServerName::Frontend, ServerName::Dashboard]
        );
        let none = ServerSelect {
            backend: false,
            frontend: false,
            dashboard: false,
        };
        assert_eq!(
            none.named_or_default(),
            vec![ServerName::Backend, ServerName::Frontend]
        );
    }

    #[test]
    fn cli_parses_start_flags() {
        let cli = Cli::try_parse_from([
            "devrack",
            "start",
            "--backend",
            "--backend-port",
            "9090",
            "--detach",
        ])
        .unwrap();
        let Commands::Start(args) = cli.command else {
            panic!("expected start");
        };
        assert!(args.select.backend);
        assert!(args.detach);
        assert_eq!(port_overrides(&args), vec![(ServerName::Backend, 9090)]);
    }

    #[test]
    fn concurrent_conflicts_with_detach() {
        let result = Cli::try_parse_from(["devrack", "start", "--detach", "--concurrent"]);
        assert!(result.is_err());
    }

    #[test]
    fn cli_parses_force_stop_all() {
        let cli = Cli::try_parse_from(["devrack", "stop", "--all", "--force"]).unwrap();
        let Commands::Stop(args) = cli.command else {
            panic!("expected stop");
        };
        assert!(args.all && args.force);
    }
}
