//! Shell command runner.
//!
//! Runs a command through the platform shell, streams stdout and stderr
//! line by line into a log queue, and relays the first signal it receives
//! to the child.

use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::transport::Signal;

/// Runs commands for job steps.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Run `command`, sending output lines to `out` and relaying at most
    /// one value from `signals` to the process.
    async fn run(
        &self,
        command: &str,
        out: &mpsc::Sender<String>,
        signals: &mut mpsc::UnboundedReceiver<Signal>,
    ) -> Result<()>;
}

/// Runner that executes commands through the system shell.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellRunner;

impl ShellRunner {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Shell executable and its "run this string" flag.
fn shell() -> (String, &'static str) {
    if cfg!(windows) {
        ("cmd".to_string(), "/C")
    } else {
        let shell = std::env::var("SHELL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/bin/bash".to_string());
        (shell, "-c")
    }
}

#[async_trait]
impl Runner for ShellRunner {
    #[instrument(skip(self, out, signals))]
    async fn run(
        &self,
        command: &str,
        out: &mpsc::Sender<String>,
        signals: &mut mpsc::UnboundedReceiver<Signal>,
    ) -> Result<()> {
        let (shell, flag) = shell();

        // Clients rely on this announcement preceding any output.
        if out.send(format!("Running {command}")).await.is_err() {
            debug!("output receiver gone, announcement dropped");
        }

        let mut cmd = Command::new(&shell);
        cmd.arg(flag)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (status, (), ()) = tokio::join!(
            wait_relaying(&mut child, signals),
            forward_lines(stdout, out),
            forward_lines(stderr, out),
        );

        let code = exit_code(status);
        debug!(exit_code = code, "Command finished");
        if code == 0 {
            Ok(())
        } else {
            Err(Error::ExitStatus { code })
        }
    }
}

/// Wait for the child to exit, relaying the first signal received.
async fn wait_relaying(
    child: &mut Child,
    signals: &mut mpsc::UnboundedReceiver<Signal>,
) -> std::io::Result<ExitStatus> {
    let mut relayed = false;
    loop {
        tokio::select! {
            status = child.wait() => return status,
            signal = signals.recv(), if !relayed => {
                relayed = true;
                if let Some(signal) = signal {
                    deliver(child, signal);
                }
            }
        }
    }
}

/// Send a signal to the child's process group.
#[cfg(unix)]
fn deliver(child: &mut Child, signal: Signal) {
    use nix::sys::signal::{killpg, Signal as NixSignal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    let pid = match i32::try_from(pid) {
        Ok(pid) => Pid::from_raw(pid),
        Err(_) => return,
    };
    match NixSignal::try_from(signal.number()) {
        Ok(sig) => {
            debug!(signal = %signal, pid = %pid, "Relaying signal to child");
            if let Err(e) = killpg(pid, sig) {
                warn!(signal = %signal, error = %e, "Failed to signal child");
            }
        }
        Err(e) => warn!(signal = %signal, error = %e, "Unsupported signal"),
    }
}

/// Without POSIX signals every relayed signal terminates the child.
#[cfg(not(unix))]
fn deliver(child: &mut Child, signal: Signal) {
    debug!(signal = %signal, "Terminating child");
    if let Err(e) = child.start_kill() {
        warn!(signal = %signal, error = %e, "Failed to terminate child");
    }
}

/// Forward each line of `pipe` to `out` until EOF.
async fn forward_lines<R: AsyncRead + Unpin>(pipe: Option<R>, out: &mpsc::Sender<String>) {
    let Some(pipe) = pipe else {
        return;
    };
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                // Keep draining even if nobody listens so the child never
                // blocks on a full pipe.
                if out.send(line).await.is_err() {
                    debug!("output receiver gone, line dropped");
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read command output");
                break;
            }
        }
    }
}

/// Exit status as an integer; 1 when the platform reports none (e.g. the
/// process was killed by a signal) or waiting failed.
fn exit_code(status: std::io::Result<ExitStatus>) -> i32 {
    match status {
        Ok(status) if status.success() => 0,
        Ok(status) => status.code().filter(|code| *code != 0).unwrap_or(1),
        Err(e) => {
            warn!(error = %e, "Failed to wait for command");
            1
        }
    }
}
