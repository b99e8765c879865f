//! PostgreSQL backend.
//!
//! Runs the official `postgres` image via the container runtime, bound to
//! a free loopback port, and hands out a [`sqlx::PgPool`] connected to the
//! `postgres` maintenance database as its client.

pub mod wipe;

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::driver::{ClientHandle, Driver, DriverState};
use crate::error::DriverError;
use crate::registry::DriverRegistry;
use crate::runtime::{ContainerRuntime, ContainerSpec};
use crate::supervisor::{Supervisor, probe_free_port};

pub use wipe::{EXCLUDED_DATABASES, EXCLUDED_ROLES, EXCLUDED_SCHEMAS};

/// Name the backend is registered under.
pub const NAME: &str = "postgres";
/// Image tag used when none is configured.
pub const DEFAULT_VERSION: &str = "16";
/// Overrides [`DEFAULT_VERSION`] for drivers built by the registry.
pub const VERSION_ENV: &str = "DBTEST_POSTGRES_VERSION";

/// Containers are named `<prefix>-<uuid>`.
pub const DEFAULT_CONTAINER_PREFIX: &str = "dbtest-postgres";

const IMAGE: &str = "postgres";
const DATABASE: &str = "postgres";
const USER: &str = "postgres";
const MAX_CONNECTIONS: u32 = 5;
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Register the PostgreSQL backend under [`NAME`].
pub fn register(registry: &mut DriverRegistry) {
    registry.register(NAME, || Box::new(PostgresDriver::from_env()));
}

/// Connection URL for a server listening on `addr`.
pub fn connection_url(addr: SocketAddr) -> String {
    format!("postgres://{USER}@{addr}/{DATABASE}")
}

enum State {
    Unstarted,
    Running(Box<Instance>),
    Stopped,
}

/// A started server and its connected client.
struct Instance {
    supervisor: Supervisor,
    container: String,
    addr: SocketAddr,
    config: Config,
    pool: PgPool,
    handle: ClientHandle,
}

/// Disposable PostgreSQL server for one test run.
///
/// Normally obtained through `dbtest::new("postgres")`, which hands back a
/// `Box<dyn Driver>` whose client downcasts to [`PgPool`].
pub struct PostgresDriver {
    config: Option<Config>,
    version: String,
    container_prefix: String,
    runtime: ContainerRuntime,
    state: State,
}

impl std::fmt::Debug for PostgresDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresDriver")
            .field("version", &self.version)
            .field("runtime", &self.runtime.binary())
            .field("state", &self.state())
            .field("url", &self.connection_url())
            .finish()
    }
}

impl PostgresDriver {
    /// Unconfigured driver for [`DEFAULT_VERSION`] on the default runtime.
    pub fn new() -> Self {
        Self::with_runtime(ContainerRuntime::from_env())
    }

    /// Like [`PostgresDriver::new`] but honouring `DBTEST_POSTGRES_VERSION`.
    pub fn from_env() -> Self {
        let mut driver = Self::new();
        if let Some(version) = env::var(VERSION_ENV).ok().filter(|v| !v.trim().is_empty()) {
            driver.version = version;
        }
        driver
    }

    pub fn with_runtime(runtime: ContainerRuntime) -> Self {
        Self {
            config: None,
            version: DEFAULT_VERSION.to_owned(),
            container_prefix: DEFAULT_CONTAINER_PREFIX.to_owned(),
            runtime,
            state: State::Unstarted,
        }
    }

    /// Select the image tag. Only effective before the server starts.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.set_version(version);
        self
    }

    pub fn set_version(&mut self, version: impl Into<String>) {
        if matches!(self.state, State::Running(_)) {
            warn!(driver = NAME, "set_version after start has no effect on the running server");
        }
        self.version = version.into();
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Prefix for container names, so a suite can find or clean up its
    /// own containers.
    pub fn with_container_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.container_prefix = prefix.into();
        self
    }

    /// Name of the running container, if started.
    pub fn container_name(&self) -> Option<&str> {
        match &self.state {
            State::Running(instance) => Some(&instance.container),
            _ => None,
        }
    }

    /// Typed shortcut for [`Driver::client`].
    pub async fn pool(&mut self) -> Result<PgPool, DriverError> {
        let handle = self.client().await?;
        handle
            .downcast_ref::<PgPool>()
            .cloned()
            .ok_or_else(|| DriverError::Backend {
                driver: NAME.to_string(),
                operation: "client",
                source: "client handle is not a PgPool".into(),
            })
    }

    fn container_spec(&self, name: &str, port: u16) -> ContainerSpec {
        let setting = |s: &str| ["-c".to_string(), s.to_string()];
        let mut args = Vec::new();
        // Loopback only, on the probed port.
        args.extend(setting("listen_addresses=127.0.0.1"));
        args.extend(["-p".to_string(), port.to_string()]);
        // Durability is pointless for throwaway data.
        args.extend(setting("fsync=off"));
        args.extend(setting("synchronous_commit=off"));
        args.extend(setting("full_page_writes=off"));

        ContainerSpec {
            name: name.to_owned(),
            image: IMAGE.to_owned(),
            tag: self.version.clone(),
            env: vec![(
                "POSTGRES_HOST_AUTH_METHOD".to_owned(),
                "trust".to_owned(),
            )],
            args,
        }
    }

    /// Launch the server, connect, and wipe residual state.
    ///
    /// On any failure after launch the server is stopped again before the
    /// error is returned.
    async fn start(&self) -> Result<Instance, DriverError> {
        let config = self.config.clone().ok_or_else(|| DriverError::NotConfigured {
            driver: NAME.to_string(),
        })?;

        self.runtime.ensure_available().await?;

        let addr = probe_free_port()?;
        let container = format!("{}-{}", self.container_prefix, Uuid::new_v4().simple());
        let spec = self.runtime.run_spec(
            format!("{NAME} container"),
            &self.container_spec(&container, addr.port()),
        );

        info!(
            driver = NAME,
            version = %self.version,
            port = addr.port(),
            container = %container,
            "starting server"
        );

        let mut supervisor = Supervisor::launch(spec, config.crash_policy)?;
        let url = connection_url(addr);

        let pool = match connect(&supervisor, &url, config.connect_timeout).await {
            Ok(pool) => pool,
            Err(e) => {
                self.abandon(&mut supervisor, &container, config.stop_timeout).await;
                return Err(e);
            }
        };

        if let Err(e) = wipe::wipe_server(&pool).await {
            close_pool(&pool, config.stop_timeout).await;
            self.abandon(&mut supervisor, &container, config.stop_timeout).await;
            return Err(e);
        }

        Ok(Instance {
            supervisor,
            container,
            addr,
            config,
            handle: ClientHandle::new(pool.clone()),
            pool,
        })
    }

    /// Best-effort teardown of a half-started server.
    ///
    /// The container is removed even after a clean stop: an interrupt that
    /// reaches the runtime client mid-create can leave it behind.
    async fn abandon(&self, supervisor: &mut Supervisor, container: &str, timeout: Duration) {
        if let Err(e) = supervisor.stop(timeout).await {
            warn!(driver = NAME, container, error = %e, "failed to stop server after failed start");
        }
        self.runtime.force_remove(container).await;
    }
}

impl Default for PostgresDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PostgresDriver {
    fn drop(&mut self) {
        if let State::Running(instance) = &self.state {
            warn!(
                driver = NAME,
                container = %instance.container,
                "driver dropped without stop; removing container"
            );
            self.runtime.force_remove_detached(&instance.container);
        }
    }
}

/// Connect to the server, retrying until `timeout` elapses.
///
/// The server needs a while to initialise its data directory before it
/// listens on TCP; refused connections in that window are expected.
async fn connect(
    supervisor: &Supervisor,
    url: &str,
    timeout: Duration,
) -> Result<PgPool, DriverError> {
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;

    loop {
        // A dead server will never accept; report the crash instead.
        supervisor.check()?;
        attempts += 1;

        let remaining = deadline.saturating_duration_since(Instant::now());
        let attempt = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(timeout)
            .connect(url);

        let reason = match tokio::time::timeout(remaining, attempt).await {
            Ok(Ok(pool)) => {
                info!(driver = NAME, url, attempts, "connected");
                return Ok(pool);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_elapsed) => "connect attempt timed out".to_string(),
        };

        if Instant::now() + CONNECT_RETRY_INTERVAL >= deadline {
            supervisor.check()?;
            return Err(DriverError::Connect {
                url: url.to_string(),
                timeout,
                reason,
            });
        }

        debug!(driver = NAME, url, attempts, reason = %reason, "server not ready; retrying");
        tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
    }
}

/// Close the pool, giving checked-out connections `timeout` to come back.
///
/// Idle connections close at once. Leaked ones are severed when the server
/// exits.
async fn close_pool(pool: &PgPool, timeout: Duration) {
    if tokio::time::timeout(timeout, pool.close()).await.is_err() {
        warn!(
            driver = NAME,
            timeout = ?timeout,
            "client connections still in use; forcing disconnect"
        );
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    fn name(&self) -> &str {
        NAME
    }

    fn set_config(&mut self, config: Config) {
        if matches!(self.state, State::Running(_)) {
            warn!(driver = NAME, "set_config after start has no effect on the running server");
        }
        self.config = Some(config);
    }

    fn state(&self) -> DriverState {
        match self.state {
            State::Unstarted => DriverState::Unstarted,
            State::Running(_) => DriverState::Running,
            State::Stopped => DriverState::Stopped,
        }
    }

    fn connection_url(&self) -> Option<String> {
        match &self.state {
            State::Running(instance) => Some(connection_url(instance.addr)),
            _ => None,
        }
    }

    async fn client(&mut self) -> Result<ClientHandle, DriverError> {
        if matches!(self.state, State::Stopped) {
            return Err(DriverError::Stopped {
                driver: NAME.to_string(),
            });
        }

        if matches!(self.state, State::Unstarted) {
            match self.start().await {
                Ok(instance) => self.state = State::Running(Box::new(instance)),
                Err(e) => {
                    // A failed start is terminal, like a stop.
                    self.state = State::Stopped;
                    return Err(e);
                }
            }
        }

        match &self.state {
            State::Running(instance) => {
                instance.supervisor.check()?;
                Ok(instance.handle.clone())
            }
            _ => Err(DriverError::Stopped {
                driver: NAME.to_string(),
            }),
        }
    }

    async fn wipe(&mut self) -> Result<(), DriverError> {
        let State::Running(instance) = &self.state else {
            return Ok(());
        };
        instance.supervisor.check()?;
        debug!(driver = NAME, container = %instance.container, "wiping server");
        wipe::wipe_server(&instance.pool).await
    }

    async fn stop(&mut self) -> Result<(), DriverError> {
        let State::Running(instance) = std::mem::replace(&mut self.state, State::Stopped) else {
            return Ok(());
        };
        let Instance {
            mut supervisor,
            container,
            config,
            pool,
            handle,
            ..
        } = *instance;

        // One grace period covers both waits. The client goes first so its
        // cleanup does not race server death, but may use at most half of it.
        let deadline = Instant::now() + config.stop_timeout;
        drop(handle);
        close_pool(&pool, config.stop_timeout / 2).await;

        let remaining = deadline.saturating_duration_since(Instant::now());
        let result = supervisor.stop(remaining).await;
        if result.is_err() {
            self.runtime.force_remove(&container).await;
        }
        result
    }

    fn check(&self) -> Result<(), DriverError> {
        match &self.state {
            State::Running(instance) => instance.supervisor.check(),
            _ => Ok(()),
        }
    }
}
