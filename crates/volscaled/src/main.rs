//! volscaled — the WarpGrid volume autoscaler daemon.
//!
//! Connects to the cluster and the metrics backend, then runs the volume
//! autoscaler until interrupted:
//! - Kubernetes client (in-cluster or kubeconfig)
//! - Metrics client (Prometheus)
//! - Volume claim watch feed
//! - Controller (synchronizer, evaluator, resize workers)
//!
//! # Usage
//!
//! ```text
//! volscaled --metrics-client-url http://prometheus-server.monitoring.svc.cluster.local \
//!           --polling-interval 30s --log-format json
//! ```

mod config;
mod convert;
mod kube_store;
mod watch_feed;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use warpgrid_volmetrics::MetricsBackend;
use warpgrid_volscale::VolumeAutoscaler;

use crate::config::{DaemonConfig, LogFormat, Overrides, Settings, parse_duration};
use crate::kube_store::KubeVolumeStore;

#[derive(Parser, Debug)]
#[command(name = "volscaled", about = "WarpGrid volume autoscaler daemon")]
struct Cli {
    /// Optional TOML config file. Flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Metrics client used to query volume stats.
    #[arg(long)]
    metrics_client: Option<MetricsBackend>,

    /// URL of the metrics client.
    #[arg(long)]
    metrics_client_url: Option<String>,

    /// Per-query metrics timeout.
    #[arg(long, value_parser = parse_duration)]
    metrics_timeout: Option<Duration>,

    /// How often to check volume usage (e.g. 30s, 1m).
    #[arg(long, value_parser = parse_duration)]
    polling_interval: Option<Duration>,

    /// Time after which an evaluation cycle is abandoned.
    #[arg(long, value_parser = parse_duration)]
    reconcile_timeout: Option<Duration>,

    /// Minimum wait after a failed resize before retrying.
    #[arg(long, value_parser = parse_duration)]
    retry_after: Option<Duration>,

    /// Maximum number of resizes applied concurrently.
    #[arg(long)]
    max_concurrent_resizes: Option<usize>,

    /// Log level; RUST_LOG takes precedence when set.
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format.
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            polling_interval: self.polling_interval,
            reconcile_timeout: self.reconcile_timeout,
            retry_after: self.retry_after,
            max_concurrent_resizes: self.max_concurrent_resizes,
            metrics_client: self.metrics_client,
            metrics_client_url: self.metrics_client_url.clone(),
            metrics_timeout: self.metrics_timeout,
            log_level: self.log_level.clone(),
            log_format: self.log_format,
        }
    }
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| EnvFilter::try_new(level.to_ascii_lowercase()).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let file = match &cli.config {
        Some(path) => DaemonConfig::from_file(path)?,
        None => DaemonConfig::default(),
    };
    let settings = Settings::resolve(file, cli.overrides())?;
    init_tracing(&settings.log_level, settings.log_format);

    info!(config = ?cli.config, "volscaled starting");

    // ── Cluster client ───────────────────────────────────────────
    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    info!("kubernetes client ready");

    // ── Metrics client ───────────────────────────────────────────
    let usage = warpgrid_volmetrics::usage_source(
        settings.metrics_client,
        &settings.metrics_client_url,
        settings.metrics_timeout,
    )
    .context("metrics client error")?;

    // ── Controller ───────────────────────────────────────────────
    let store = Arc::new(KubeVolumeStore::new(client.clone()));
    let (events, feed_handle) = watch_feed::spawn_watch_feed(client);
    let controller = VolumeAutoscaler::new(settings.controller, store, usage);

    // ── Shutdown signal ──────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
            // Keep the sender alive; dropping it would stop the controller.
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let result = controller.run(events, shutdown_rx).await;
    feed_handle.abort();

    result?;
    info!("volscaled stopped");
    Ok(())
}
