//! Configuration for devrack.
//!
//! This module defines the structure of the optional `devrack.toml` file and
//! resolves it, together with built-in defaults, into concrete launch recipes
//! for each server.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::server::ServerName;

/// Default state directory, relative to the working directory.
const DEFAULT_STATE_DIR: &str = ".devrack/pids";

/// Top-level configuration structure corresponding to `devrack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Directory holding process record files.
    pub state_dir: Option<String>,
    /// Per-server overrides.
    #[serde(default)]
    pub servers: ServerTable,
}

/// The per-server override tables.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerTable {
    pub backend: Option<ServerConfig>,
    pub frontend: Option<ServerConfig>,
    pub dashboard: Option<ServerConfig>,
}

/// Configuration for a single server.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    /// Command line to execute (parsed with shell-words).
    pub cmd: Option<String>,
    /// Working directory for the server.
    pub cwd: Option<String>,
    /// TCP port the server listens on.
    pub port: Option<u16>,
    /// Environment variables to set for the server.
    pub env: Option<HashMap<String, String>>,
}

/// A concrete, resolved launch recipe for one server.
#[derive(Debug, Clone)]
pub struct RunRecipe {
    /// The command executable.
    pub cmd: String,
    /// Arguments for the command.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: Option<String>,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// TCP port the server is expected to listen on.
    pub port: u16,
}

/// Fully resolved settings: state directory plus one recipe per server.
#[derive(Debug, Clone)]
pub struct Settings {
    pub state_dir: PathBuf,
    recipes: HashMap<ServerName, RunRecipe>,
}

impl Settings {
    /// Resolves settings from an optional config file and per-port CLI overrides.
    pub fn resolve(config: Config, port_overrides: &[(ServerName, u16)]) -> Result<Self> {
        let state_dir = PathBuf::from(config.state_dir.as_deref().unwrap_or(DEFAULT_STATE_DIR));
        let mut recipes = HashMap::new();
        for name in ServerName::ALL {
            let override_config = match name {
                ServerName::Backend => config.servers.backend.clone(),
                ServerName::Frontend => config.servers.frontend.clone(),
                ServerName::Dashboard => config.servers.dashboard.clone(),
            };
            let mut recipe = resolve_recipe(name, override_config)?;
            if let Some((_, port)) = port_overrides.iter().find(|(n, _)| *n == name) {
                recipe.port = *port;
            }
            recipes.insert(name, recipe);
        }
        Ok(Self { state_dir, recipes })
    }

    /// Returns the recipe for a server name.
    pub fn recipe(&self, name: ServerName) -> &RunRecipe {
        // resolve() populates every name, so the entry always exists.
        &self.recipes[&name]
    }

    /// Returns the configured port for a server name.
    pub fn port(&self, name: ServerName) -> u16 {
        self.recipe(name).port
    }
}

fn resolve_recipe(name: ServerName, config: Option<ServerConfig>) -> Result<RunRecipe> {
    let config = config.unwrap_or_default();
    let cmd_line = config.cmd.unwrap_or_else(|| default_cmd(name).to_string());
    let mut parts = shell_words::split(&cmd_line)
        .with_context(|| format!("failed to parse cmd for {}", name))?;
    if parts.is_empty() {
        return Err(anyhow!("empty cmd for {}", name));
    }
    let cmd = parts.remove(0);
    Ok(RunRecipe {
        cmd,
        args: parts,
        cwd: config.cwd,
        env: config.env.unwrap_or_default(),
        port: config.port.unwrap_or_else(|| name.default_port()),
    })
}

fn default_cmd(name: ServerName) -> &'static str {
    match name {
        ServerName::Backend => "cargo run --bin backend",
        ServerName::Frontend => "npm run dev",
        ServerName::Dashboard => "cargo run --bin dashboard",
    }
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Returns `devrack.toml` in the working directory, if it exists.
pub fn default_config_path() -> Option<PathBuf> {
    let path = Path::new("devrack.toml");
    if path.exists() {
        Some(path.to_path_buf())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_server() {
        let settings = Settings::resolve(Config::default(), &[]).unwrap();
        assert_eq!(settings.port(ServerName::Backend), 8080);
        assert_eq!(settings.port(ServerName::Frontend), 3000);
        assert_eq!(settings.port(ServerName::Dashboard), 8090);
        assert_eq!(settings.recipe(ServerName::Frontend).cmd, "npm");
        assert_eq!(settings.recipe(ServerName::Frontend).args, vec!["run", "dev"]);
    }

    #[test]
    fn parses_overrides() {
        let raw = r#"
state_dir = "run/pids"

[servers.backend]
cmd = "cargo run --release"
port = 9000
cwd = "server"

[servers.frontend]
cmd = "pnpm dev"
env = { NODE_ENV = "development" }
"#;
        let config: Config = toml::from_str(raw).unwrap();
        let settings = Settings::resolve(config, &[]).unwrap();
        assert_eq!(settings.state_dir, PathBuf::from("run/pids"));
        let backend = settings.recipe(ServerName::Backend);
        assert_eq!(backend.cmd, "cargo");
        assert_eq!(backend.args, vec!["run", "--release"]);
        assert_eq!(backend.port, 9000);
        assert_eq!(backend.cwd.as_deref(), Some("server"));
        let frontend = settings.recipe(ServerName::Frontend);
        assert_eq!(frontend.cmd, "pnpm");
        assert_eq!(
            frontend.env.get("NODE_ENV").map(String::as_str),
            Some("development")
        );
        // Untouched server keeps its defaults.
        assert_eq!(settings.port(ServerName::Dashboard), 8090);
    }

    #[test]
    fn cli_port_overrides_win() {
        let settings =
            Settings::resolve(Config::default(), &[(ServerName::Backend, 8181)]).unwrap();
        assert_eq!(settings.port(ServerName::Backend), 8181);
        assert_eq!(settings.port(ServerName::Frontend), 3000);
    }

    #[test]
    fn empty_cmd_is_rejected() {
        let config: Config = toml::from_str("[servers.backend]\ncmd = \"\"\n").unwrap();
        assert!(Settings::resolve(config, &[]).is_err());
    }
}
