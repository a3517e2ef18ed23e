//! Port-based process discovery.
//!
//! When the record store has no usable PID for a server, the locator asks the
//! operating system who owns the server's well-known TCP port. PID-yielding
//! strategies (`lsof`, `ss` on unix; `netstat` on windows) are tried first; a
//! plain connect probe is the last resort and can only prove that *something*
//! is listening. Missing tools, non-zero exits, and unparsable output all
//! degrade to the next strategy instead of erroring.

use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::debug;

/// Result of asking who owns a TCP port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortOwner {
    /// A listening process was found and identified.
    Owner(u32),
    /// Something is listening but no PID could be recovered.
    Busy,
    /// Nothing is listening on the port.
    Free,
    /// The probe itself failed; the port state could not be determined.
    Unknown,
}

/// Timeout for the connect probe; local listeners answer well within this.
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Returns the process currently holding the TCP listening socket on `port`.
pub fn find_owner_of_port(port: u16) -> PortOwner {
    if let Some(pid) = pid_strategies(port) {
        debug!(port, pid, "port owner discovered");
        return PortOwner::Owner(pid);
    }
    connect_probe(port)
}

#[cfg(unix)]
fn pid_strategies(port: u16) -> Option<u32> {
    if let Some(output) = run_tool("lsof", &["-ti".into(), format!("tcp:{}", port), "-sTCP:LISTEN".into()]) {
        if let Some(pid) = parse_lsof_output(&output) {
            return Some(pid);
        }
    }
    if let Some(output) = run_tool(
        "ss",
        &["-ltnpH".into(), format!("sport = :{}", port)],
    ) {
        if let Some(pid) = parse_ss_output(&output) {
            return Some(pid);
        }
    }
    None
}

#[cfg(windows)]
fn pid_strategies(port: u16) -> Option<u32> {
    let output = run_tool("netstat", &["-ano".into(), "-p".into(), "tcp".into()])?;
    parse_netstat_output(&output, port)
}

/// Runs an introspection tool, returning stdout only on a clean, non-empty
/// result. An absent tool or failing invocation yields `None`.
fn run_tool(tool: &str, args: &[String]) -> Option<String> {
    let output = Command::new(tool)
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output();
    match output {
        Ok(output) if output.status.success() => {
            let text = String::from_utf8_lossy(&output.stdout).into_owned();
            if text.trim().is_empty() {
                None
            } else {
                Some(text)
            }
        }
        Ok(_) => None,
        Err(err) => {
            debug!(tool, error = %err, "introspection tool unavailable");
            None
        }
    }
}

/// `lsof -t` prints one PID per line.
fn parse_lsof_output(output: &str) -> Option<u32> {
    output.lines().find_map(|line| line.trim().parse::<u32>().ok())
}

/// `ss -ltnp` embeds the owner as `users:(("cmd",pid=1234,fd=5))`.
fn parse_ss_output(output: &str) -> Option<u32> {
    let start = output.find("pid=")? + "pid=".len();
    let digits: String = output[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<u32>().ok()
}

/// `netstat -ano` rows: proto, local address, foreign address, state, PID.
#[cfg_attr(not(windows), allow(dead_code))]
fn parse_netstat_output(output: &str, port: u16) -> Option<u32> {
    let suffix = format!(":{}", port);
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 {
            continue;
        }
        if !fields[1].ends_with(&suffix) {
            continue;
        }
        if !fields[3].eq_ignore_ascii_case("LISTENING") {
            continue;
        }
        if let Ok(pid) = fields[4].parse::<u32>() {
            return Some(pid);
        }
    }
    None
}

/// Connect probe: proves a listener exists but cannot recover its PID.
fn connect_probe(port: u16) -> PortOwner {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    match TcpStream::connect_timeout(&addr, PROBE_TIMEOUT) {
        Ok(_) => PortOwner::Busy,
        Err(err) if err.kind() == std::io::ErrorKind::ConnectionRefused => PortOwner::Free,
        Err(err) => {
            debug!(port, error = %err, "connect probe failed");
            PortOwner::Unknown
        }
    }
}
