//! kilnd — the kiln daemon.
//!
//! Assembles the pieces and runs the reconciliation loop:
//! - a compute backend (LXD or GCP), selected once at startup
//! - the GitHub token provider and release client
//! - the metrics server
//! - the signal listener (SIGTERM exits immediately, SIGINT drains)
//!
//! # Usage
//!
//! ```text
//! kilnd --org acme --repo widgets --labels self-hosted,linux \
//!       --backend lxd --target-idle 2
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{error, info};

use kiln_autoscale::{Autoscaler, AutoscalerConfig};
use kiln_backend::{AnyBackend, GcpBackend, LxdBackend};
use kiln_core::PrepareOptions;
use kiln_github::{RegistrationTokenProvider, ReleaseClient};
use kiln_metrics::RunnerGauges;

/// Fixed interval between reconciliation ticks.
const TICK_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "kilnd", about = "Ephemeral GitHub Actions runner autoscaler")]
struct Cli {
    /// GitHub organization name.
    #[arg(long, env = "GITHUB_ORG")]
    org: String,

    /// GitHub repository name.
    #[arg(long, env = "GITHUB_REPO")]
    repo: String,

    /// Labels runners register with (comma-separated).
    #[arg(long, env = "KILN_RUNNER_LABELS")]
    labels: String,

    /// Target number of idle runners.
    #[arg(long, default_value = "1")]
    target_idle: u32,

    /// Path to a custom cloud-init overlay merged into the prepare document.
    #[arg(long)]
    custom_cloud_init: Option<PathBuf>,

    /// Compute backend to use.
    #[arg(long, value_enum, default_value = "lxd")]
    backend: BackendKind,

    /// Address to serve Prometheus metrics on.
    #[arg(long, default_value = "0.0.0.0:9090")]
    metrics_addr: SocketAddr,

    /// GCP project (gcp backend).
    #[arg(long, env = "GOOGLE_CLOUD_PROJECT")]
    gcp_project: Option<String>,

    /// GCP zone (gcp backend).
    #[arg(long, env = "GOOGLE_CLOUD_ZONE")]
    gcp_zone: Option<String>,

    /// Instance template runner instances launch from (gcp backend).
    #[arg(long, env = "GOOGLE_CLOUD_INSTANCE_TEMPLATE")]
    gcp_template: Option<String>,

    /// Path to the LXD daemon socket (lxd backend).
    #[arg(long, default_value = "/var/lib/lxd/unix.socket")]
    lxd_socket: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendKind {
    Lxd,
    Gcp,
}

/// The two shutdown contracts: an immediate signal exits with no cleanup,
/// a graceful one drains the idle pool first.
enum ShutdownIntent {
    Immediate,
    Graceful,
}

async fn shutdown_intent() -> ShutdownIntent {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = sigterm.recv() => ShutdownIntent::Immediate,
        _ = tokio::signal::ctrl_c() => ShutdownIntent::Graceful,
    }
}

fn build_backend(cli: &Cli, releases: ReleaseClient) -> anyhow::Result<AnyBackend> {
    match cli.backend {
        BackendKind::Lxd => Ok(AnyBackend::Lxd(LxdBackend::new(&cli.lxd_socket, releases))),
        BackendKind::Gcp => {
            let project = cli
                .gcp_project
                .clone()
                .context("--gcp-project (GOOGLE_CLOUD_PROJECT) is required for the gcp backend")?;
            let zone = cli
                .gcp_zone
                .clone()
                .context("--gcp-zone (GOOGLE_CLOUD_ZONE) is required for the gcp backend")?;
            let backend = GcpBackend::new(project, zone, cli.gcp_template.clone(), releases)?;
            Ok(AnyBackend::Gcp(backend))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,kilnd=debug,kiln=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    // Fatal configuration problems must surface before the loop starts.
    let github_token =
        std::env::var("GITHUB_TOKEN").context("GITHUB_TOKEN must be set")?;
    let custom_overlay = match &cli.custom_cloud_init {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?,
        ),
        None => None,
    };

    let releases = ReleaseClient::new()?;
    let backend = build_backend(&cli, releases)?;
    let tokens = RegistrationTokenProvider::new(&cli.org, &cli.repo, github_token)?;
    info!(org = %cli.org, repo = %cli.repo, backend = ?cli.backend, "kilnd starting");

    // ── Metrics server ─────────────────────────────────────────

    let gauges = Arc::new(RunnerGauges::new());
    let router = kiln_metrics::metrics_router(gauges.clone());
    let listener = tokio::net::TcpListener::bind(cli.metrics_addr)
        .await
        .with_context(|| format!("binding metrics listener on {}", cli.metrics_addr))?;
    info!(addr = %cli.metrics_addr, "metrics server starting");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!(error = %e, "metrics server failed");
        }
    });

    // ── Shutdown signals ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match shutdown_intent().await {
            ShutdownIntent::Immediate => {
                info!("termination signal received, exiting");
                std::process::exit(0);
            }
            ShutdownIntent::Graceful => {
                info!("interrupt received, draining runners before exit");
                let _ = shutdown_tx.send(true);
            }
        }
    });

    // ── Reconciliation loop ────────────────────────────────────

    let autoscaler = Autoscaler::new(
        backend,
        tokens,
        AutoscalerConfig {
            target_idle: cli.target_idle,
            labels: cli.labels.clone(),
            prepare: PrepareOptions { custom_overlay },
        },
        gauges,
    );

    autoscaler.run(TICK_INTERVAL, shutdown_rx).await;

    info!("kilnd stopped");
    Ok(())
}
