//! Container runtime used to launch server images.
//!
//! Servers run as `docker run --rm --net=host <image>:<tag> ...` so they
//! bind directly to a loopback port chosen on the host. The runtime binary
//! is `docker` unless `DBTEST_CONTAINER_RUNTIME` names another
//! docker-compatible CLI (e.g. `podman`).

use std::collections::HashMap;
use std::env;
use std::process::Stdio;
use std::sync::{LazyLock, Mutex, PoisonError};
use std::thread;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::DriverError;
use crate::supervisor::LaunchSpec;

/// Result of `<runtime> info` per runtime binary; `Err` holds its output.
static AVAILABILITY: LazyLock<Mutex<HashMap<String, Result<(), String>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// A server container to run in the foreground.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name (`--name`).
    pub name: String,
    /// Image repository, e.g. `postgres`.
    pub image: String,
    /// Image tag, e.g. `16`.
    pub tag: String,
    /// Environment passed with `-e KEY=VALUE`.
    pub env: Vec<(String, String)>,
    /// Arguments passed to the image entrypoint.
    pub args: Vec<String>,
}

impl ContainerSpec {
    /// `image:tag` reference.
    pub fn reference(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }
}

/// Handle to a docker-compatible CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRuntime {
    binary: String,
}

impl ContainerRuntime {
    pub const DEFAULT_BINARY: &str = "docker";
    pub const BINARY_ENV: &str = "DBTEST_CONTAINER_RUNTIME";

    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Runtime named by `DBTEST_CONTAINER_RUNTIME`, else `docker`.
    pub fn from_env() -> Self {
        let binary = env::var(Self::BINARY_ENV)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| Self::DEFAULT_BINARY.to_owned());
        Self::new(binary)
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Check that the runtime works by running `<runtime> info`.
    ///
    /// The result is cached per binary for the life of the process, so a
    /// broken environment fails every driver the same way without
    /// re-running the check.
    pub async fn ensure_available(&self) -> Result<(), DriverError> {
        let cached = AVAILABILITY
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&self.binary)
            .cloned();

        let result = match cached {
            Some(result) => result,
            None => {
                let result = self.probe_info().await;
                AVAILABILITY
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(self.binary.clone(), result.clone());
                result
            }
        };

        result.map_err(|output| DriverError::RuntimeUnavailable {
            runtime: self.binary.clone(),
            output,
        })
    }

    async fn probe_info(&self) -> Result<(), String> {
        debug!(runtime = %self.binary, "checking container runtime");
        let output = Command::new(&self.binary)
            .arg("info")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("failed to run {} info: {e}", self.binary))?;

        if output.status.success() {
            info!(runtime = %self.binary, "container runtime available");
            return Ok(());
        }

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        warn!(runtime = %self.binary, status = %output.status, "container runtime check failed");
        Err(text)
    }

    /// Build the launch spec for running `container` in the foreground.
    ///
    /// The container shares the host network so the server binds straight
    /// to the loopback port given in its arguments, and is removed on exit.
    pub fn run_spec(&self, label: impl Into<String>, container: &ContainerSpec) -> LaunchSpec {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--net=host".to_string(),
            "--name".to_string(),
            container.name.clone(),
        ];
        for (key, value) in &container.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(container.reference());
        args.extend(container.args.iter().cloned());

        LaunchSpec::new(label, self.binary.clone())
            .args(args)
            .probe(self.sibling_probe(&container.reference()))
    }

    /// Shell command listing running containers of the same image.
    pub fn sibling_probe(&self, reference: &str) -> String {
        format!("{} ps --filter ancestor={reference}", self.binary)
    }

    /// Remove a container, ignoring "no such container".
    pub async fn force_remove(&self, name: &str) {
        let result = Command::new(&self.binary)
            .args(["rm", "-f", name])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        match result {
            Ok(output) if output.status.success() => {
                debug!(container = name, "container removed");
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.contains("No such container") {
                    warn!(container = name, stderr = %stderr.trim(), "container removal failed");
                }
            }
            Err(e) => warn!(container = name, error = %e, "failed to run container removal"),
        }
    }

    /// Fire-and-forget variant of [`ContainerRuntime::force_remove`] for
    /// use where awaiting is impossible (e.g. `Drop`).
    ///
    /// The removal process is reaped on a background thread; the returned
    /// handle joins once it has exited. `None` if it could not be spawned.
    pub fn force_remove_detached(&self, name: &str) -> Option<thread::JoinHandle<()>> {
        let spawned = std::process::Command::new(&self.binary)
            .args(["rm", "-f", name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!(container = name, error = %e, "failed to spawn container removal");
                return None;
            }
        };

        let container = name.to_owned();
        let reaper = thread::Builder::new()
            .name("dbtest-rm-reaper".to_owned())
            .spawn(move || match child.wait() {
                Ok(status) => debug!(container = %container, %status, "detached removal finished"),
                Err(e) => warn!(container = %container, error = %e, "failed to reap removal"),
            });
        match reaper {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(container = name, error = %e, "failed to start removal reaper");
                None
            }
        }
    }
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::from_env()
    }
}
