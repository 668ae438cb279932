//! # keel-operator
//!
//! Runs the keel controllers.
//!
//! The operator reconciles topology kinds, entities and relations against the
//! topology service of their namespace, and pushes compiled model plugins to
//! every model registry replica. In local mode the stores and backends are
//! in-process and loaded from a seed file.
//!
//! ## Usage
//!
//! ```bash
//! # Run every controller against a seeded local control plane
//! keel-operator serve --seed crates/keel-operator/seeds/network.json
//!
//! # Admit one pod against the seeded records and print the response
//! keel-operator admit --seed seeds/network.json --pod pod.json
//!
//! # Print the resolved configuration
//! keel-operator config
//! ```

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

mod plane;
mod seed;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;

use keel_admission::config::InjectorConfig;
use keel_admission::registry::AdmissionRequest;
use keel_core::api::workload::Pod;
use keel_core::observability::{LogFormat, init_logging};
use keel_core::record::Record;
use keel_reconcile::config::Config;

use crate::plane::LocalPlane;
use crate::seed::Seed;

// ============================================================================
// CLI Arguments
// ============================================================================

/// keel operator.
#[derive(Debug, Parser)]
#[command(name = "keel-operator")]
#[command(about = "Converges topology and configuration model records onto their backends")]
#[command(version)]
struct Args {
    /// Log format (`json` or `pretty`).
    #[arg(long, env = "KEEL_LOG_FORMAT", default_value = "pretty", global = true)]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every controller against a local control plane.
    Serve {
        /// Seed file with the records to load.
        #[arg(long, env = "KEEL_SEED")]
        seed: PathBuf,

        /// Address of the Prometheus scrape endpoint.
        #[arg(long, env = "KEEL_METRICS_ADDR", default_value = "0.0.0.0:9090")]
        metrics_addr: SocketAddr,

        /// Directory of compiled `<type>-<version>.so` plugins. Seeded
        /// artifacts are used when unset.
        #[arg(long, env = "KEEL_ARTIFACT_DIR")]
        artifact_dir: Option<PathBuf>,
    },

    /// Run one pod through registry admission and print the response.
    Admit {
        /// Seed file with the registries and models to read.
        #[arg(long, env = "KEEL_SEED")]
        seed: PathBuf,

        /// Pod record to admit, as JSON.
        #[arg(long)]
        pod: PathBuf,
    },

    /// Print the resolved configuration as JSON.
    Config,
}

/// Everything the operator reads from the environment.
#[derive(Debug, Serialize)]
struct ResolvedConfig {
    reconcile: Config,
    admission: InjectorConfig,
}

impl ResolvedConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            reconcile: Config::from_env().context("invalid controller configuration")?,
            admission: InjectorConfig::from_env().context("invalid admission configuration")?,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_format.parse::<LogFormat>()?);

    let config = ResolvedConfig::from_env()?;
    match args.command {
        Commands::Serve {
            seed,
            metrics_addr,
            artifact_dir,
        } => serve(config, &seed, metrics_addr, artifact_dir).await,
        Commands::Admit { seed, pod } => admit(config, &seed, &pod).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn serve(
    config: ResolvedConfig,
    seed: &Path,
    metrics_addr: SocketAddr,
    artifact_dir: Option<PathBuf>,
) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .context("failed to install prometheus exporter")?;
    keel_reconcile::metrics::describe_metrics();
    keel_admission::metrics::describe_metrics();

    tracing::info!(
        seed = %seed.display(),
        %metrics_addr,
        workers = config.reconcile.workers,
        watch_namespace = ?config.reconcile.watch_namespace,
        "Starting keel operator"
    );

    let mut plane = LocalPlane::new(config.reconcile, config.admission, artifact_dir);
    plane.load(Seed::from_path(seed).await?).await?;

    let (stop, shutdown) = watch::channel(false);
    let mut controllers = JoinSet::new();
    plane.spawn_controllers(&mut controllers, &shutdown)?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested, draining controllers");
    stop.send(true)?;
    while let Some(joined) = controllers.join_next().await {
        if let Err(err) = joined {
            tracing::error!(error = %err, "controller task failed");
        }
    }

    plane.report().await?;
    tracing::info!("keel operator stopped");
    Ok(())
}

async fn admit(config: ResolvedConfig, seed: &Path, pod_path: &Path) -> Result<()> {
    let mut plane = LocalPlane::new(config.reconcile, config.admission, None);
    plane.load(Seed::from_path(seed).await?).await?;

    let raw = tokio::fs::read(pod_path)
        .await
        .with_context(|| format!("failed to read pod {}", pod_path.display()))?;
    let pod: Record<Pod> = serde_json::from_slice(&raw)
        .with_context(|| format!("invalid pod {}", pod_path.display()))?;
    let response = plane
        .injector()
        .handle(&AdmissionRequest::for_pod(&pod)?)
        .await;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
