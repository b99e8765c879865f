//! Error taxonomy for driver operations.
//!
//! Every failure a driver can hit maps to one [`ErrorKind`], so callers can
//! tell "forgot to close a client" apart from "server crashed" without
//! matching on message text.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Broad category of a [`DriverError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Broken test setup: unknown backend, operation out of order.
    Configuration,
    /// The host cannot run servers at all (container runtime missing or no
    /// free port).
    Environment,
    /// The server process could not be launched.
    Launch,
    /// The server process exited while nobody asked it to.
    Crash,
    /// The server process did not exit within the stop grace period.
    Timeout,
    /// The server never accepted a client connection in time.
    Connect,
    /// A backend command (e.g. dropping a database during wipe) failed.
    Backend,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Configuration => "configuration",
            Self::Environment => "environment",
            Self::Launch => "launch",
            Self::Crash => "crash",
            Self::Timeout => "timeout",
            Self::Connect => "connect",
            Self::Backend => "backend",
        };
        f.write_str(s)
    }
}

/// Postmortem for a server process that died unexpectedly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashReport {
    /// Human-readable label of the process (e.g. `postgres container`).
    pub label: String,
    /// Exit status as reported by the OS.
    pub status: String,
    /// Everything the process wrote to stdout and stderr.
    pub output: String,
    /// Best-effort listing of sibling server processes at the time of death.
    pub siblings: String,
}

impl fmt::Display for CrashReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "---- {} died unexpectedly ({}):", self.label, self.status)?;
        writeln!(f, "{}", self.output.trim_end())?;
        writeln!(f, "---- {} siblings running right now:", self.label)?;
        writeln!(f, "{}", self.siblings.trim_end())?;
        write!(f, "----------------------------------------")
    }
}

/// Errors returned by drivers and the registry.
#[derive(Debug, Error)]
pub enum DriverError {
    /// No factory is registered under the requested name.
    #[error("dbtest: driver not found: {name:?}")]
    UnknownDriver { name: String },

    /// An operation needing a config ran before `set_config`.
    #[error("dbtest: {driver} driver used before set_config")]
    NotConfigured { driver: String },

    /// The driver has been stopped and cannot be restarted.
    #[error("dbtest: {driver} driver already stopped; obtain a fresh instance")]
    Stopped { driver: String },

    /// The container runtime is not installed or not working.
    #[error("{runtime} is not installed or is not running properly:\n{output}")]
    RuntimeUnavailable { runtime: String, output: String },

    /// Could not bind a local listener to discover a free port.
    #[error("unable to listen on a local address")]
    PortProbe(#[source] std::io::Error),

    /// Spawning the server process failed.
    #[error("{program} failed to start:\n{output}")]
    Launch {
        program: String,
        output: String,
        #[source]
        source: std::io::Error,
    },

    /// The server process exited unexpectedly.
    #[error("{0}")]
    Crashed(Box<CrashReport>),

    /// The server did not exit within the stop grace period.
    #[error("timeout waiting for {label} process to die after {timeout:?} (client leak?)")]
    StopTimeout { label: String, timeout: Duration },

    /// The server did not accept a connection within the connect timeout.
    #[error("failed to connect to {url} within {timeout:?}: {reason}")]
    Connect {
        url: String,
        timeout: Duration,
        reason: String,
    },

    /// A backend command failed.
    #[error("{driver} {operation} failed")]
    Backend {
        driver: String,
        operation: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl DriverError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownDriver { .. } | Self::NotConfigured { .. } | Self::Stopped { .. } => {
                ErrorKind::Configuration
            }
            Self::RuntimeUnavailable { .. } | Self::PortProbe(_) => ErrorKind::Environment,
            Self::Launch { .. } => ErrorKind::Launch,
            Self::Crashed(_) => ErrorKind::Crash,
            Self::StopTimeout { .. } => ErrorKind::Timeout,
            Self::Connect { .. } => ErrorKind::Connect,
            Self::Backend { .. } => ErrorKind::Backend,
        }
    }

    /// Wrap a backend client error.
    pub fn backend(
        driver: impl Into<String>,
        operation: &'static str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            driver: driver.into(),
            operation,
            source: Box::new(source),
        }
    }
}
