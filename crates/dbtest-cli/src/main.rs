mod doctor_cmd;
mod run_cmd;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "dbtest", about = "Disposable database servers for integration tests")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List registered backends
    List,
    /// Check that the container runtime is usable
    Doctor,
    /// Start a server, print its URL, and stop it on Ctrl-C
    Run {
        /// Backend name (see `dbtest list`)
        backend: String,
        /// Seconds to wait for the server to accept connections
        /// (overrides DBTEST_CONNECT_TIMEOUT_SECS)
        #[arg(long)]
        connect_timeout: Option<u64>,
        /// Seconds to wait for the server to exit on stop
        /// (overrides DBTEST_STOP_TIMEOUT_SECS)
        #[arg(long)]
        stop_timeout: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::List => {
            for name in dbtest::registered_drivers() {
                println!("{name}");
            }
        }
        Commands::Doctor => {
            doctor_cmd::run_doctor().await?;
        }
        Commands::Run {
            backend,
            connect_timeout,
            stop_timeout,
        } => {
            run_cmd::run_server(&backend, connect_timeout, stop_timeout).await?;
        }
    }

    Ok(())
}
