//! Platform-specific process primitives.
//!
//! All platform branching lives here: liveness probes, signal delivery,
//! detached-spawn flags, and the OS-native force-kill fallback. Callers
//! (launcher, terminator, locator, status) never branch on platform
//! themselves.

use std::io;

use tokio::process::Command;

/// Returns true if a process with this PID is currently alive.
///
/// On unix this is the null-signal probe: `kill(pid, 0)` succeeds for a live
/// process, and a permission error still proves existence. On windows it asks
/// `tasklist` to filter on the PID.
pub fn pid_alive(pid: u32) -> bool {
    imp::pid_alive(pid)
}

/// Sends a graceful termination request to the process (and its group).
///
/// Returns `ErrorKind::NotFound` if the process is already gone.
pub fn send_terminate(pid: u32) -> io::Result<()> {
    imp::send_terminate(pid)
}

/// Sends an unconditional kill to the process (and its group).
///
/// Returns `ErrorKind::NotFound` if the process is already gone, and
/// `ErrorKind::Unsupported` where the platform has no direct kill signal;
/// callers fall back to [`native_force_kill`] for both `Unsupported` and
/// permission errors.
pub fn send_kill(pid: u32) -> io::Result<()> {
    imp::send_kill(pid)
}

/// Forces termination through the platform's external kill utility
/// (`kill -9` on unix, `taskkill /F /T` on windows).
pub async fn native_force_kill(pid: u32) -> io::Result<()> {
    let status = imp::force_kill_command(pid).status().await?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!(
            "force-kill utility exited with {}",
            status.code().unwrap_or(1)
        )))
    }
}

/// Puts a foreground child in its own process group so group-wide signals
/// reach the whole server, not the supervisor.
pub fn configure_foreground(command: &mut Command) {
    imp::configure_foreground(command);
}

/// Detaches a child so it outlives the supervisor process. The launcher
/// additionally redirects the child's stdio away from the terminal.
pub fn configure_detached(command: &mut Command) {
    imp::configure_detached(command);
}

#[cfg(unix)]
mod imp {
    use std::io;

    use tokio::process::Command;

    pub fn pid_alive(pid: u32) -> bool {
        let rc = unsafe { libc::kill(pid as i32, 0) };
        if rc == 0 {
            return true;
        }
        // EPERM means the process exists but belongs to another user.
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    pub fn send_terminate(pid: u32) -> io::Result<()> {
        signal(pid, libc::SIGTERM)
    }

    pub fn send_kill(pid: u32) -> io::Result<()> {
        signal(pid, libc::SIGKILL)
    }

    fn signal(pid: u32, sig: i32) -> io::Result<()> {
        let pid = pid as i32;
        unsafe {
            // Signal the group first so children of the server die with it;
            // the direct kill covers processes that never became leaders.
            let group = libc::kill(-pid, sig);
            let direct = libc::kill(pid, sig);
            if group == 0 || direct == 0 {
                return Ok(());
            }
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such process"));
        }
        Err(err)
    }

    pub fn configure_foreground(command: &mut Command) {
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }
    }

    pub fn configure_detached(command: &mut Command) {
        unsafe {
            command.pre_exec(|| {
                // New session: no controlling terminal, survives the
                // supervisor's exit.
                let _ = libc::setsid();
                Ok(())
            });
        }
    }

    pub fn force_kill_command(pid: u32) -> Command {
        let mut command = Command::new("kill");
        command.arg("-9").arg(pid.to_string());
        command
    }
}

#[cfg(windows)]
mod imp {
    use std::io;
    use std::process::Stdio;

    use tokio::process::Command;

    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    const DETACHED_PROCESS: u32 = 0x0000_0008;

    pub fn pid_alive(pid: u32) -> bool {
        let output = std::process::Command::new("tasklist")
            .args(["/FI", &format!("PID eq {}", pid), "/NH"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output();
        match output {
            Ok(output) => {
                let text = String::from_utf8_lossy(&output.stdout);
                text.split_whitespace().any(|token| token == pid.to_string())
            }
            Err(_) => false,
        }
    }

    pub fn send_terminate(pid: u32) -> io::Result<()> {
        use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};
        // CTRL_BREAK is the closest console signal to SIGTERM on windows.
        let ok = unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn send_kill(_pid: u32) -> io::Result<()> {
        // No direct kill signal; the terminator escalates to taskkill.
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "direct kill unavailable, use taskkill",
        ))
    }

    pub fn configure_foreground(command: &mut Command) {
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    pub fn configure_detached(command: &mut Command) {
        command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
    }

    pub fn force_kill_command(pid: u32) -> Command {
        let mut command = Command::new("taskkill");
        command.args(["/PID", &pid.to_string(), "/F", "/T"]);
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_alive_for_self() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    #[cfg(unix)]
    fn pid_alive_false_for_impossible_pid() {
        assert!(!pid_alive(999_999_999));
    }

    #[test]
    #[cfg(unix)]
    fn terminate_missing_process_reports_not_found() {
        let err = send_terminate(999_999_999).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
