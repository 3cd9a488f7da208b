//! poolscaled, the CI agent pool autoscaler daemon.
//!
//! Reads one Autoscaler resource per `*.toml` file in a config directory
//! and runs a reconcile loop for each, persisting pool status to redb.
//!
//! # Usage
//!
//! ```text
//! poolscaled check /etc/poolscale
//! poolscaled run /etc/poolscale --data-dir /var/lib/poolscale --reload 30
//! poolscaled status --data-dir /var/lib/poolscale
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use poolscale_core::AutoscalerConfig;
use poolscale_core::config::{load_dir, process_env};
use poolscale_state::StateStore;
use poolscaled::Supervisor;

const DEFAULT_FILTER: &str = "info,poolscale=debug,poolscaled=debug";

#[derive(Parser)]
#[command(name = "poolscaled", about = "Autoscaler for CI build agent pools")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the reconcile loop of every resource in the config directory.
    Run {
        /// Directory holding one `*.toml` file per Autoscaler resource.
        config_dir: PathBuf,

        /// Data directory for persistent state.
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,

        /// Seconds between config directory re-reads.
        #[arg(long, default_value_t = 30)]
        reload: u64,
    },
    /// Validate the config directory and print the resolved resources.
    Check {
        config_dir: PathBuf,
    },
    /// Print the persisted status of every resource.
    Status {
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Command::Run {
            config_dir,
            data_dir,
            reload,
        } => run(config_dir, data_dir, reload).await,
        Command::Check { config_dir } => check(&config_dir),
        Command::Status { data_dir } => status(&data_dir),
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(config_dir: PathBuf, data_dir: PathBuf, reload: u64) -> anyhow::Result<()> {
    if reload == 0 {
        bail!("--reload must be at least 1 second");
    }
    info!(
        config_dir = %config_dir.display(),
        data_dir = %data_dir.display(),
        reload,
        "starting poolscaled"
    );

    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    let db_path = data_dir.join("poolscale.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = %db_path.display(), "state store opened");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for CTRL+C");
            return;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    Supervisor::new(config_dir, store)
        .run(Duration::from_secs(reload), shutdown_rx)
        .await?;

    info!("poolscaled stopped");
    Ok(())
}

fn check(config_dir: &Path) -> anyhow::Result<()> {
    let loaded = load_dir(config_dir, &process_env)?;
    if loaded.is_empty() {
        bail!("no *.toml resources in {}", config_dir.display());
    }

    let mut failed = 0;
    for resource in &loaded {
        match &resource.result {
            Ok(config) => println!("ok      {}  {}", resource.path.display(), describe(config)),
            Err(e) => {
                failed += 1;
                println!("error   {}  {e}", resource.path.display());
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} resources failed to load", loaded.len());
    }
    Ok(())
}

/// One-line summary of a resolved resource. Secrets are never printed.
fn describe(config: &AutoscalerConfig) -> String {
    let selector: Vec<String> = config
        .selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    let max_actions = config
        .config
        .max_actions
        .map_or_else(|| "unbounded".to_string(), |n| n.to_string());
    format!(
        "name={} provider={} server={} pool={}..{} min_age={:?} recycle={} \
         concurrency={} interval={:?} timeout={:?} grace={:?} max_actions={} selector=[{}]",
        config.name,
        config.provider.kind(),
        config.server.url(),
        config.pool.min,
        config.pool.max,
        config.pool.min_age,
        config.pool.recycle,
        config.agent.concurrency,
        config.config.interval,
        config.config.timeout,
        config.config.grace,
        max_actions,
        selector.join(","),
    )
}

fn status(data_dir: &Path) -> anyhow::Result<()> {
    let db_path = data_dir.join("poolscale.redb");
    if !db_path.exists() {
        bail!("no state store at {}", db_path.display());
    }
    let store = StateStore::open(&db_path)?;
    for status in store.list_statuses()? {
        println!("{}", serde_json::to_string(&status)?);
    }
    Ok(())
}
