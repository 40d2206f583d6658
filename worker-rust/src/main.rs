mod config;
mod connection;
mod device;
mod engine;
mod error;
mod pool;
mod process;
mod worker;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::future::Future;
use std::io::Read;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use config::{Config, CoordinatorAddr, DEFAULT_PORT};
use device::{Device, IsolatedCatalog};
use engine::native::NativeGaFactory;
use pool::WorkerPool;
use process::ProcessLauncher;
use worker::Worker;

#[derive(Parser)]
#[command(
    name = "gaia-ga-worker",
    about = "GAIA GA worker pool: one worker per compute device",
    version,
    args_conflicts_with_subcommands = true,
    subcommand_negates_reqs = true
)]
struct Cli {
    /// Coordinator host (e.g. 192.168.1.10)
    #[arg(env = "GAIA_GA_SERVER", required = true)]
    server: Option<String>,

    /// Coordinator port
    #[arg(env = "GAIA_GA_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    #[command(subcommand)]
    internal: Option<Internal>,
}

/// Entry points the pool re-executes itself with.
#[derive(Subcommand)]
enum Internal {
    /// Print the devices visible to this process as JSON
    #[command(name = device::LIST_DEVICES_SUBCOMMAND, hide = true)]
    ListDevices,

    /// Run a single worker bound to one device
    #[command(name = process::WORKER_SUBCOMMAND, hide = true)]
    Worker {
        #[arg(long)]
        platform: u32,

        #[arg(long)]
        device: u32,

        /// Exit once stdin reaches EOF
        #[arg(long)]
        supervised: bool,

        server: String,

        #[arg(default_value_t = DEFAULT_PORT)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout belongs to the device list of `list-devices`
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.internal {
        Some(Internal::ListDevices) => device::print_devices(),
        Some(Internal::Worker { platform, device, supervised, server, port }) => {
            let coordinator = CoordinatorAddr::new(server, port);
            run_worker(Device::slot(platform, device), coordinator, supervised).await
        }
        None => {
            let server = cli.server.context("Coordinator address is required")?;
            run_pool(CoordinatorAddr::new(server, cli.port)).await
        }
    }
}

async fn run_pool(coordinator: CoordinatorAddr) -> Result<()> {
    let program = std::env::current_exe().context("Cannot determine current exe path")?;
    let cfg = Config::new(coordinator, program);
    tracing::info!(
        coordinator = %cfg.coordinator,
        version = %config::VERSION,
        "Starting GAIA GA worker pool"
    );

    let mut pool = WorkerPool::new(
        Box::new(IsolatedCatalog::new(&cfg.worker_program)),
        Box::new(ProcessLauncher::new(&cfg.worker_program)),
        cfg.shutdown_grace,
    );
    pool.start(&cfg.coordinator).await?;
    tracing::info!(workers = pool.len(), "Worker pool running");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(cfg.poll_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !pool.is_alive() {
                    tracing::info!("A worker has exited, bye bye!");
                    break;
                }
            }
            _ = &mut shutdown => break,
        }
    }

    pool.shutdown().await;
    tracing::info!("Worker pool shut down");
    Ok(())
}

async fn run_worker(slot: Device, coordinator: CoordinatorAddr, supervised: bool) -> Result<()> {
    let shutdown = CancellationToken::new();
    if supervised {
        watch_supervisor(shutdown.clone());
    }
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        on_signal.cancel();
    });

    Worker::new(slot, Arc::new(NativeGaFactory), shutdown).run(&coordinator).await
}

/// The pool holds our stdin open; EOF means it wants us gone.
fn watch_supervisor(shutdown: CancellationToken) {
    // not tokio::io::stdin: its pending read would block runtime shutdown
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin().lock();
        let mut buf = [0u8; 256];
        while matches!(stdin.read(&mut buf), Ok(n) if n > 0) {}
        tracing::info!("Supervisor closed stdin, shutting down");
        shutdown.cancel();
    });
}

/// Resolves once `handler` fires. A handler that failed to install never fires.
async fn delivered(name: &str, handler: impl Future<Output = std::io::Result<()>>) {
    if let Err(e) = handler.await {
        tracing::warn!("Failed to install {name} handler: {e}");
        std::future::pending::<()>().await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = delivered("SIGINT", signal::ctrl_c());
    #[cfg(unix)]
    let terminate = delivered("SIGTERM", async {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        sigterm.recv().await;
        Ok::<_, std::io::Error>(())
    });
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_failed_signal_handler_never_fires() {
        let failed = async { Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "gone")) };
        let fired = timeout(Duration::from_millis(100), delivered("SIGINT", failed)).await;
        assert!(fired.is_err(), "install failure must not read as a signal");
    }

    #[tokio::test]
    async fn test_delivered_signal_fires() {
        let ready = async { Ok::<_, std::io::Error>(()) };
        let fired = timeout(Duration::from_secs(1), delivered("SIGTERM", ready)).await;
        assert!(fired.is_ok());
    }
}
