//! `dbtest doctor` command: check the container runtime.

use anyhow::{Context, Result};

use dbtest::runtime::ContainerRuntime;

/// Run the availability check and report the outcome.
pub async fn run_doctor() -> Result<()> {
    let runtime = ContainerRuntime::from_env();
    println!("Container runtime: {}", runtime.binary());

    runtime
        .ensure_available()
        .await
        .with_context(|| format!("`{} info` failed", runtime.binary()))?;

    println!("  OK");
    println!("Backends: {}", dbtest::registered_drivers().join(", "));
    Ok(())
}
