//! Shared test utilities for dbtest integration tests.
//!
//! Tests that launch real servers need a working container runtime. When
//! none is available (e.g. CI without docker) those tests print a skip
//! notice and return early instead of failing.

use std::sync::Once;

use sqlx::PgPool;
use tokio::sync::OnceCell;
use tracing_subscriber::EnvFilter;

use dbtest::postgres::PostgresDriver;
use dbtest::runtime::ContainerRuntime;
use dbtest::{Config, Driver};

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness's captured writer.
///
/// Honours `RUST_LOG`; defaults to `dbtest=debug`. Safe to call from every
/// test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("dbtest=debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Whether the container runtime works, checked once per test binary.
static RUNTIME_OK: OnceCell<bool> = OnceCell::const_new();

/// Return `true` if servers can be launched; otherwise print why the
/// calling test is being skipped.
pub async fn require_container_runtime(test: &str) -> bool {
    let ok = *RUNTIME_OK
        .get_or_init(|| async {
            match ContainerRuntime::from_env().ensure_available().await {
                Ok(()) => true,
                Err(e) => {
                    eprintln!("container runtime unavailable: {e}");
                    false
                }
            }
        })
        .await;
    if !ok {
        eprintln!("skipping {test}: no container runtime");
    }
    ok
}

/// A configured, unstarted PostgreSQL driver.
pub fn postgres_driver(config: Config) -> PostgresDriver {
    let mut driver = PostgresDriver::from_env();
    driver.set_config(config);
    driver
}

/// Start `driver` and return its pool, panicking on failure.
pub async fn start(driver: &mut PostgresDriver) -> PgPool {
    driver
        .pool()
        .await
        .unwrap_or_else(|e| panic!("failed to start postgres: {e}"))
}
