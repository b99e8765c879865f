//! Server process supervision.
//!
//! A [`Supervisor`] owns one launched server process. It captures the
//! process output, runs a background monitor task that waits for the
//! process to exit, and stops the process within a bounded grace period.
//!
//! # Architecture
//!
//! ```text
//! Supervisor::launch(spec)
//!     |
//!     +--> Child (stdout/stderr --> OutputBuffer)
//!     |
//!     +--> monitor task: child.wait()
//!              |
//!              +-- expected_death cancelled?  --> Exit::Expected
//!              +-- otherwise                  --> Exit::Crashed(report)
//!
//! Supervisor::stop(timeout)
//!     1. expected_death.cancel()
//!     2. monitor sends SIGINT (or kills where there is no SIGINT),
//!        only while the child is still unreaped
//!     3. wait for monitor, at most `timeout`
//! ```

pub mod output;
pub mod port;

use std::io;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CrashPolicy;
use crate::error::{CrashReport, DriverError};

pub use output::OutputBuffer;
pub use port::probe_free_port;

/// How long the monitor waits for output readers to hit EOF after exit.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
/// Upper bound for the postmortem diagnostic command.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything needed to launch and diagnose a server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Label used in logs and crash reports (e.g. "postgres container").
    pub label: String,
    /// Program to execute.
    pub program: String,
    /// Program arguments.
    pub args: Vec<String>,
    /// Shell command listing sibling server processes, run on crash.
    pub probe: Option<String>,
}

impl LaunchSpec {
    pub fn new(label: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            probe: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn probe(mut self, command: impl Into<String>) -> Self {
        self.probe = Some(command.into());
        self
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    /// The process exited after [`Supervisor::stop`] asked it to.
    Expected,
    /// The process exited on its own.
    Crashed(CrashReport),
}

/// Owner of a running server process and its monitor task.
#[derive(Debug)]
pub struct Supervisor {
    label: String,
    pid: u32,
    output: OutputBuffer,
    expected_death: CancellationToken,
    monitor: Option<JoinHandle<()>>,
    exit: watch::Receiver<Option<Exit>>,
}

impl Supervisor {
    /// Launch the process described by `spec` and start its monitor.
    ///
    /// Must be called from within a tokio runtime.
    pub fn launch(spec: LaunchSpec, crash_policy: CrashPolicy) -> Result<Self, DriverError> {
        let output = OutputBuffer::new();

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        restore_default_interrupt(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| {
            // Print now as well: the caller may only surface the kind.
            error!(process = %spec.label, program = %spec.program, error = %source, "failed to start");
            DriverError::Launch {
                program: spec.program.clone(),
                output: output.snapshot(),
                source,
            }
        })?;

        let pid = child.id().ok_or_else(|| DriverError::Launch {
            program: spec.program.clone(),
            output: output.snapshot(),
            source: io::Error::other("process exited before its pid was read"),
        })?;

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(output.capture(spec.label.clone(), stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(output.capture(spec.label.clone(), stderr));
        }

        let expected_death = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);

        let monitor = tokio::spawn(monitor(
            child,
            MonitorTask {
                label: spec.label.clone(),
                probe: spec.probe.clone(),
                output: output.clone(),
                readers,
                expected_death: expected_death.clone(),
                crash_policy,
                exit: exit_tx,
            },
        ));

        info!(process = %spec.label, pid, "server process started");

        Ok(Self {
            label: spec.label,
            pid,
            output,
            expected_death,
            monitor: Some(monitor),
            exit: exit_rx,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Output captured so far.
    pub fn output(&self) -> String {
        self.output.snapshot()
    }

    /// `true` until the process has exited or been stopped.
    pub fn is_running(&self) -> bool {
        self.monitor.is_some() && self.exit.borrow().is_none()
    }

    /// Fail if the monitor has seen the process die unexpectedly.
    pub fn check(&self) -> Result<(), DriverError> {
        match &*self.exit.borrow() {
            Some(Exit::Crashed(report)) => Err(DriverError::Crashed(Box::new(report.clone()))),
            _ => Ok(()),
        }
    }

    /// Wait until the monitor has recorded how the process ended.
    ///
    /// Returns `None` if the monitor went away without recording anything.
    pub async fn wait_exit(&mut self) -> Option<Exit> {
        match self.exit.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone(),
            Err(_) => None,
        }
    }

    /// Stop the process and wait at most `timeout` for it to exit.
    ///
    /// Calling this again after it returned is a no-op. If the process had
    /// already crashed, the crash is reported instead. On timeout the
    /// process is force-killed and [`DriverError::StopTimeout`] returned.
    pub async fn stop(&mut self, timeout: Duration) -> Result<(), DriverError> {
        let Some(mut monitor) = self.monitor.take() else {
            return Ok(());
        };

        // The monitor owns the child and delivers the signal itself, so a
        // pid that has already been reaped is never signalled.
        self.expected_death.cancel();

        match tokio::time::timeout(timeout, &mut monitor).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(process = %self.label, error = %e, "monitor task ended abnormally");
            }
            Err(_elapsed) => {
                // Dropping the child inside the aborted task kills it.
                monitor.abort();
                error!(
                    process = %self.label,
                    pid = self.pid,
                    timeout = ?timeout,
                    "timeout waiting for process to die"
                );
                return Err(DriverError::StopTimeout {
                    label: self.label.clone(),
                    timeout,
                });
            }
        }

        // A crash that raced with the stop request still counts as a crash.
        self.check()?;
        info!(process = %self.label, pid = self.pid, "server process stopped");
        Ok(())
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            warn!(
                process = %self.label,
                pid = self.pid,
                "supervisor dropped without stop; killing process"
            );
            self.expected_death.cancel();
            monitor.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Monitor task
// ---------------------------------------------------------------------------

struct MonitorTask {
    label: String,
    probe: Option<String>,
    output: OutputBuffer,
    readers: Vec<JoinHandle<()>>,
    expected_death: CancellationToken,
    crash_policy: CrashPolicy,
    exit: watch::Sender<Option<Exit>>,
}

async fn monitor(mut child: Child, task: MonitorTask) {
    let mut stop_requested = false;
    let status = loop {
        tokio::select! {
            biased;
            status = child.wait() => break status,
            _ = task.expected_death.cancelled(), if !stop_requested => {
                stop_requested = true;
                request_exit(&mut child, &task.label);
            }
        }
    };

    // Decided at exit time: a stop requested while output is still
    // draining must not turn a crash into an expected exit.
    let expected = task.expected_death.is_cancelled();

    let readers = task.readers;
    let drain = async move {
        for reader in readers {
            let _ = reader.await;
        }
    };
    if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drain).await.is_err() {
        debug!(process = %task.label, "output still open after exit; snapshotting anyway");
    }

    let status = match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("wait failed: {e}"),
    };

    if expected {
        debug!(process = %task.label, %status, "server process exited as expected");
        task.exit.send_replace(Some(Exit::Expected));
        return;
    }

    let siblings = match &task.probe {
        Some(probe) => run_probe(probe).await,
        None => String::new(),
    };
    let report = CrashReport {
        label: task.label.clone(),
        status,
        output: task.output.snapshot(),
        siblings,
    };

    error!(
        process = %report.label,
        status = %report.status,
        output = %report.output,
        siblings = %report.siblings,
        "server process died unexpectedly"
    );

    if task.crash_policy == CrashPolicy::Abort {
        eprintln!("{report}");
        eprintln!("dbtest: {} died unexpectedly; aborting", report.label);
        std::process::abort();
    }

    task.exit.send_replace(Some(Exit::Crashed(report)));
}

/// Run the diagnostic shell command, returning its combined output.
async fn run_probe(probe: &str) -> String {
    let (shell, flag) = if cfg!(windows) { ("cmd", "/C") } else { ("sh", "-c") };
    let run = Command::new(shell)
        .args([flag, probe])
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(PROBE_TIMEOUT, run).await {
        Ok(Ok(out)) => {
            let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&out.stderr));
            text
        }
        Ok(Err(e)) => format!("probe `{probe}` failed: {e}"),
        Err(_) => format!("probe `{probe}` timed out after {PROBE_TIMEOUT:?}"),
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Ask a still-unreaped child to exit: SIGINT where there is one, a
/// forced kill elsewhere or when the signal cannot be sent.
///
/// Returns `false` without touching anything once the child has been
/// reaped, since its pid may belong to another process by then.
fn request_exit(child: &mut Child, label: &str) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };

    #[cfg(unix)]
    match signal_interrupt(pid) {
        Ok(()) => {
            debug!(process = %label, pid, "sent interrupt");
            return true;
        }
        Err(e) => warn!(process = %label, pid, error = %e, "failed to signal process; killing it"),
    }

    if let Err(e) = child.start_kill() {
        warn!(process = %label, pid, error = %e, "failed to kill process");
    }
    true
}

/// Processes started from a backgrounded shell inherit SIGINT as ignored,
/// which would turn the stop signal into a no-op.
#[cfg(unix)]
fn restore_default_interrupt(cmd: &mut Command) {
    // SAFETY: signal(2) is async-signal-safe and touches no Rust state.
    unsafe {
        cmd.pre_exec(|| {
            libc::signal(libc::SIGINT, libc::SIG_DFL);
            Ok(())
        });
    }
}

/// Ask the process to stop gracefully with SIGINT.
///
/// A process that is already gone (ESRCH) counts as success.
#[cfg(unix)]
fn signal_interrupt(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid exceeds pid_t"))?;
    // SAFETY: kill(2) is memory-safe for any pid; failures come back as errno.
    let ret = unsafe { libc::kill(pid, libc::SIGINT) };
    if ret == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}
