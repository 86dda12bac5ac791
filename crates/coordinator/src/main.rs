use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use scan_pool_coordinator::{Coordinator, CoordinatorConfig};
use scan_pool_observability::ObservabilityConfig;
use tracing::info;

/// Hand out search jobs to connected scan workers.
#[derive(Debug, Parser)]
#[command(name = "scan-pool-coordinator", version)]
struct Args {
    /// Listen port. Overrides SCAN_POOL_PORT.
    #[arg(long)]
    port: Option<u16>,

    /// Persisted job list. Overrides SCAN_POOL_JOBS_FILE.
    #[arg(long)]
    jobs_file: Option<PathBuf>,

    /// Where uploaded rel files are kept. Overrides SCAN_POOL_REL_DIR.
    #[arg(long)]
    rel_dir: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,

    /// Write daily-rotated log files here instead of stdout.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut observability = ObservabilityConfig::new("scan-pool-coordinator");
    observability.json = args.json_logs;
    observability.log_dir = args.log_dir;
    let _observability = scan_pool_observability::init(&observability)?;

    let mut config = CoordinatorConfig::default();
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(jobs_file) = args.jobs_file {
        config.jobs_file = jobs_file;
    }
    if let Some(rel_dir) = args.rel_dir {
        config.rel_dir = rel_dir;
    }

    let coordinator = Coordinator::new(config);
    let loaded = coordinator
        .jobs()
        .read_config()
        .await
        .with_context(|| format!("loading {}", coordinator.config().jobs_file.display()))?;
    let tasks = coordinator.spawn_background();

    let addr = SocketAddr::from(([0, 0, 0, 0], coordinator.config().port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, jobs = loaded, "coordinator listening");

    axum::serve(
        listener,
        coordinator
            .router()
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    })
    .await
    .context("coordinator server")?;

    coordinator.shutdown();
    for task in tasks {
        let _ = task.await;
    }
    if let Err(e) = coordinator.jobs().persist().await {
        tracing::error!(error = %e, "final job list save failed");
    }
    Ok(())
}
