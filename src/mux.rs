//! Concurrent mode: several servers in one terminal with merged output.
//!
//! Each server gets a dedicated reader task that pumps its stdout and stderr
//! lines into one shared queue; a single printer task drains the queue and is
//! the only writer to the console, prefixing every line with its source tag.
//! Shutdown is cooperative through one shared cancellation flag: an interrupt
//! sets it, each reader asks its own child to terminate, and the printer
//! exits once every source has delivered its closed-stream sentinel (or a
//! short grace period after cancellation elapses).

use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc::{self, error::TryRecvError, Receiver, Sender};
use tokio::time::sleep;
use tracing::debug;

use crate::config::RunRecipe;
use crate::launcher;
use crate::platform;
use crate::server::ServerName;
use crate::store::RecordStore;

/// A unit of output flowing from a child into the shared queue.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub source: ServerName,
    pub text: String,
    /// Closed-stream sentinel; carries no real text.
    pub terminal: bool,
}

impl OutputLine {
    fn text(source: ServerName, text: String) -> Self {
        Self {
            source,
            text,
            terminal: false,
        }
    }

    fn terminal(source: ServerName) -> Self {
        Self {
            source,
            text: String::new(),
            terminal: true,
        }
    }
}

/// Queue depth for the shared line channel.
const QUEUE_DEPTH: usize = 256;
/// Printer sleep between empty-queue polls.
const PRINT_POLL: Duration = Duration::from_millis(50);
/// Reader interval for observing the cancellation flag.
const CANCEL_POLL: Duration = Duration::from_millis(100);
/// After cancellation, how long a reader waits before force-killing a child
/// that ignored the graceful request.
const CANCEL_GRACE: Duration = Duration::from_secs(5);
/// After cancellation, how long the printer keeps draining before giving up
/// on missing sentinels.
const PRINTER_GRACE: Duration = Duration::from_secs(1);

/// Runs the given servers concurrently until they exit or an interrupt
/// arrives.
pub async fn run_concurrent(
    targets: Vec<(ServerName, RunRecipe)>,
    store: &RecordStore,
) -> Result<()> {
    let cancel = Arc::new(AtomicBool::new(false));
    spawn_interrupt_listener(cancel.clone());
    run_with_cancel(targets, store, cancel).await
}

/// Concurrent run with an externally controlled cancellation flag.
async fn run_with_cancel(
    targets: Vec<(ServerName, RunRecipe)>,
    store: &RecordStore,
    cancel: Arc<AtomicBool>,
) -> Result<()> {
    let sources = targets.len();
    let (tx, rx) = mpsc::channel::<OutputLine>(QUEUE_DEPTH);
    let printer = tokio::spawn(print_lines(rx, sources, cancel.clone()));

    let mut readers = Vec::new();
    for (name, recipe) in targets {
        match launcher::spawn_captured(name, &recipe, store) {
            Ok(child) => {
                let tx = tx.clone();
                let cancel = cancel.clone();
                let store = store.clone();
                readers.push(tokio::spawn(read_server(name, child, tx, cancel, store)));
            }
            Err(err) => {
                // One server's failure is reported as output; its siblings
                // keep running.
                let _ = tx
                    .send(OutputLine::text(name, format!("failed to start: {:#}", err)))
                    .await;
                let _ = tx.send(OutputLine::terminal(name)).await;
            }
        }
    }
    drop(tx);

    for reader in readers {
        let _ = reader.await;
    }
    let _ = printer.await;
    Ok(())
}

/// Reads one server's stdout and stderr to exhaustion, pushing lines into the
/// shared queue, then emits the terminal sentinel and clears the record.
async fn read_server(
    name: ServerName,
    mut child: Child,
    tx: Sender<OutputLine>,
    cancel: Arc<AtomicBool>,
    store: RecordStore,
) {
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        let _ = tx
            .send(OutputLine::text(name, "output streams unavailable".to_string()))
            .await;
        let _ = tx.send(OutputLine::terminal(name)).await;
        return;
    };
    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();
    let mut out_done = false;
    let mut err_done = false;
    let mut stop_requested_at: Option<tokio::time::Instant> = None;
    let mut ticker = tokio::time::interval(CANCEL_POLL);

    while !(out_done && err_done) {
        tokio::select! {
            line = out_lines.next_line(), if !out_done => match line {
                Ok(Some(text)) => {
                    let _ = tx.send(OutputLine::text(name, sanitize_line(&text))).await;
                }
                _ => out_done = true,
            },
            line = err_lines.next_line(), if !err_done => match line {
                Ok(Some(text)) => {
                    let _ = tx.send(OutputLine::text(name, sanitize_line(&text))).await;
                }
                _ => err_done = true,
            },
            _ = ticker.tick() => {
                if cancel.load(Ordering::Relaxed) {
                    match stop_requested_at {
                        None => {
                            stop_requested_at = Some(tokio::time::Instant::now());
                            if let Some(pid) = child.id() {
                                debug!(server = %name, pid, "interrupt: requesting termination");
                                let _ = platform::send_terminate(pid);
                            }
                        }
                        Some(at) if at.elapsed() >= CANCEL_GRACE => {
                            // The graceful request was ignored; close the
                            // streams the hard way.
                            let _ = child.start_kill();
                        }
                        Some(_) => {}
                    }
                }
            }
        }
    }

    let _ = tx.send(OutputLine::terminal(name)).await;
    let _ = child.wait().await;
    store.delete(name);
}

/// Drains the shared queue and writes each line, source-tagged, to stdout.
///
/// This is the sole console writer, which keeps concurrent output from
/// interleaving mid-line. Within one source, order is preserved; across
/// sources only best-effort temporal interleaving is promised.
async fn print_lines(mut rx: Receiver<OutputLine>, sources: usize, cancel: Arc<AtomicBool>) {
    let color = use_color();
    let mut finished = 0;
    let mut cancel_seen_at: Option<tokio::time::Instant> = None;
    loop {
        match rx.try_recv() {
            Ok(line) if line.terminal => {
                finished += 1;
                if finished >= sources {
                    break;
                }
            }
            Ok(line) => {
                println!("{} {}", source_tag(line.source, color), line.text);
            }
            Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {
                if cancel.load(Ordering::Relaxed) {
                    let at = cancel_seen_at.get_or_insert_with(tokio::time::Instant::now);
                    if at.elapsed() >= PRINTER_GRACE {
                        break;
                    }
                }
                sleep(PRINT_POLL).await;
            }
        }
    }
}

fn source_tag(name: ServerName, color: bool) -> String {
    let tag = format!("[{}]", name);
    if color {
        format!("\u{1b}[{}m{}\u{1b}[0m", name.color_code(), tag)
    } else {
        tag
    }
}

fn use_color() -> bool {
    std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none()
}

/// Strips ANSI escapes from child output so embedded control sequences cannot
/// garble the merged console feed.
fn sanitize_line(text: &str) -> String {
    let stripped = strip_ansi_escapes::strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

fn spawn_interrupt_listener(cancel: Arc<AtomicBool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        cancel.store(true, Ordering::Relaxed);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::{Ipv4Addr, TcpListener};
    use tempfile::TempDir;

    fn recipe(cmd: &str, args: &[&str]) -> RunRecipe {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        RunRecipe {
            cmd: cmd.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: None,
            env: HashMap::new(),
            port,
        }
    }

    fn store() -> (TempDir, RecordStore) {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(dir.path().to_path_buf());
        (dir, store)
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn reader_delivers_lines_then_terminal_sentinel() {
        let (_dir, store) = store();
        let recipe = recipe("sh", &["-c", "echo one; echo two >&2"]);
        let child = launcher::spawn_captured(ServerName::Backend, &recipe, &store).unwrap();
        let (tx, mut rx) = mpsc::channel(QUEUE_DEPTH);
        let cancel = Arc::new(AtomicBool::new(false));

        read_server(ServerName::Backend, child, tx, cancel, store.clone()).await;

        let mut texts = Vec::new();
        let mut terminals = 0;
        while let Ok(line) = rx.try_recv() {
            if line.terminal {
                terminals += 1;
            } else {
                texts.push(line.text);
            }
        }
        texts.sort();
        assert_eq!(texts, vec!["one", "two"]);
        assert_eq!(terminals, 1);
        // The record is cleared once the child is gone.
        assert_eq!(store.load(ServerName::Backend), None);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn reader_strips_ansi_escapes() {
        let (_dir, store) = store();
        let recipe = recipe("sh", &["-c", r"printf '\033[31mred\033[0m\n'"]);
        let child = launcher::spawn_captured(ServerName::Dashboard, &recipe, &store).unwrap();
        let (tx, mut rx) = mpsc::channel(QUEUE_DEPTH);
        let cancel = Arc::new(AtomicBool::new(false));

        read_server(ServerName::Dashboard, child, tx, cancel, store.clone()).await;

        let first = rx.try_recv().unwrap();
        assert_eq!(first.text, "red");
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn failed_start_does_not_stop_siblings() {
        let (_dir, store) = store();
        // Frontend runner lookup fails before any spawn; backend runs to
        // completion regardless.
        let targets = vec![
            (ServerName::Frontend, recipe("devrack-no-such-runner", &["dev"])),
            (ServerName::Backend, recipe("sh", &["-c", "echo alive"])),
        ];
        let cancel = Arc::new(AtomicBool::new(false));
        run_with_cancel(targets, &store, cancel).await.unwrap();

        assert_eq!(store.load(ServerName::Frontend), None);
        // Backend ran and exited; its record was cleaned up by the reader.
        assert_eq!(store.load(ServerName::Backend), None);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn cancellation_stops_long_running_children() {
        let (_dir, store) = store();
        let targets = vec![
            (ServerName::Backend, recipe("sh", &["-c", "echo up; exec sleep 30"])),
            (ServerName::Dashboard, recipe("sh", &["-c", "echo up; exec sleep 30"])),
        ];
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(300)).await;
            flag.store(true, Ordering::Relaxed);
        });

        let started = std::time::Instant::now();
        tokio::time::timeout(
            Duration::from_secs(5),
            run_with_cancel(targets, &store, cancel),
        )
        .await
        .expect("concurrent run did not shut down")
        .unwrap();

        // Both children were asked to stop and their records cleared.
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(store.load(ServerName::Backend), None);
        assert_eq!(store.load(ServerName::Dashboard), None);
    }
}
