//! `dbtest run <backend>` command: keep a server up until Ctrl-C.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use dbtest::{Config, Driver};

/// Resolve the config: flags override environment, environment overrides
/// defaults.
fn resolve_config(connect_timeout: Option<u64>, stop_timeout: Option<u64>) -> Config {
    let mut config = Config::from_env();
    if let Some(secs) = connect_timeout {
        config = config.with_connect_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = stop_timeout {
        config = config.with_stop_timeout(Duration::from_secs(secs));
    }
    config
}

/// Start `backend`, print its connection URL, and stop it on Ctrl-C.
pub async fn run_server(
    backend: &str,
    connect_timeout: Option<u64>,
    stop_timeout: Option<u64>,
) -> Result<()> {
    let config = resolve_config(connect_timeout, stop_timeout);
    let mut server = dbtest::new_with_config(backend, config)
        .with_context(|| format!("cannot create backend {backend:?}"))?;

    server
        .client()
        .await
        .with_context(|| format!("failed to start {backend}"))?;

    match server.connection_url() {
        Some(url) => println!("{url}"),
        None => println!("{backend} is running"),
    }
    eprintln!("Press Ctrl-C to stop.");

    // Report a crash as soon as the monitor sees it instead of on Ctrl-C.
    let mut poll = tokio::time::interval(Duration::from_millis(500));
    let interrupted = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => break signal,
            _ = poll.tick() => {
                if let Err(e) = server.check() {
                    // Clears the crashed instance; the crash is the error worth showing.
                    let _ = server.stop().await;
                    return Err(e).with_context(|| format!("{backend} stopped unexpectedly"));
                }
            }
        }
    };
    interrupted.context("failed to listen for Ctrl-C")?;

    info!(backend, "stopping server");
    server
        .stop()
        .await
        .with_context(|| format!("failed to stop {backend}"))?;
    println!("Stopped.");
    Ok(())
}
