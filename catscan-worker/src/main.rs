mod drivers;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use catscan_config::{Backend, ConfigLoader, WorkerConfig};
use catscan_core::catalog::CatalogSource;
use catscan_core::clock::{Clock, SystemClock};
use catscan_core::lease::PostgresLeaseService;
use catscan_core::queue::PostgresWorkQueue;
use catscan_core::storage::PostgresEntityStore;
use catscan_core::{
    CursorService, EngineComponents, HttpCatalogClient, ScanEngine, ScanWorker, StartOutcome,
    spawn_worker_pool,
};
use catscan_model::{DriverType, ScanId};
use chrono::{DateTime, Utc};
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde_json::json;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "catscan")]
#[command(about = "Catalog scan worker and operator commands")]
struct Cli {
    /// Config file (TOML or JSON); overrides CATSCAN_CONFIG_PATH
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the worker pool until Ctrl-C
    Run(RunArgs),
    /// Start every enabled driver that can make progress
    UpdateAll {
        /// Upper bound for every driver (RFC 3339); defaults to the catalog commit
        #[arg(long, value_parser = parse_timestamp)]
        max: Option<DateTime<Utc>>,
    },
    /// Start one driver over (min, max]
    Start {
        driver: String,
        #[arg(long, value_parser = parse_timestamp)]
        min: Option<DateTime<Utc>>,
        #[arg(long, value_parser = parse_timestamp)]
        max: Option<DateTime<Utc>>,
    },
    /// Abort the in-flight scan of a driver
    Abort { driver: String },
    /// Re-enqueue the remaining work of a waiting scan
    Requeue { driver: String, scan_id: String },
    /// Show a driver's cursor, dependencies and latest scans
    Status { driver: String },
    /// Print the effective configuration as TOML
    Config,
    /// Apply database migrations and exit
    Migrate,
}

#[derive(ClapArgs, Debug, Clone)]
struct RunArgs {
    /// Also run update-all on this interval (e.g. "5m", "1h 30m")
    #[arg(long, env = "CATSCAN_UPDATE_EVERY", value_parser = humantime::parse_duration)]
    update_every: Option<Duration>,
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, humantime::TimestampError> {
    humantime::parse_rfc3339_weak(raw).map(DateTime::<Utc>::from)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_config_path(path);
    }
    let load = loader.load().context("failed to load configuration")?;
    if let Some(path) = &load.env_file {
        info!(path = %path.display(), "loaded .env file");
    }
    let config = load.config;

    match cli.command {
        Command::Config => {
            let rendered =
                toml::to_string_pretty(&config).context("failed to render configuration")?;
            println!("{rendered}");
            Ok(())
        }
        Command::Migrate => run_migrate(&config).await,
        command => {
            let (engine, cursors) = build_engine(&config).await?;
            if config.backend == Backend::Memory && !matches!(command, Command::Run(_)) {
                warn!("memory backend: scan state lives only as long as this process");
            }
            dispatch(command, engine, cursors).await
        }
    }
}

async fn connect(config: &WorkerConfig) -> anyhow::Result<PgPool> {
    let url = config
        .database
        .url
        .as_deref()
        .context("no database URL configured")?;
    PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(url)
        .await
        .context("failed to connect to PostgreSQL")
}

async fn run_migrate(config: &WorkerConfig) -> anyhow::Result<()> {
    let pool = connect(config).await?;
    catscan_core::MIGRATOR
        .run(&pool)
        .await
        .context("database migration failed")?;
    info!("Database migrations applied successfully");
    Ok(())
}

async fn build_engine(config: &WorkerConfig) -> anyhow::Result<(ScanEngine, CursorService)> {
    let catalog: Arc<dyn CatalogSource> = Arc::new(
        HttpCatalogClient::new(&config.engine.catalog).context("failed to build catalog client")?,
    );

    let components = match config.backend {
        Backend::Memory => EngineComponents::in_memory(catalog),
        Backend::Postgres => {
            let pool = connect(config).await?;
            let clock: Arc<dyn Clock> = Arc::new(SystemClock);
            EngineComponents {
                store: Arc::new(
                    PostgresEntityStore::new(pool.clone())
                        .await
                        .context("entity store unavailable")?,
                ),
                queue: Arc::new(
                    PostgresWorkQueue::new(pool.clone())
                        .await
                        .context("work queue unavailable")?,
                ),
                leases: Arc::new(PostgresLeaseService::new(pool)),
                catalog,
                clock,
            }
        }
    };

    let engine = ScanEngine::new(components, drivers::registry(), config.engine.clone());
    let cursors = CursorService::new(engine.clone());
    info!(
        backend = ?config.backend,
        drivers = ?engine.drivers.startable(),
        workers = config.engine.queue.worker_count,
        "scan engine ready"
    );
    Ok((engine, cursors))
}

async fn dispatch(
    command: Command,
    engine: ScanEngine,
    cursors: CursorService,
) -> anyhow::Result<()> {
    match command {
        Command::Run(args) => run_workers(engine, cursors, args).await,
        Command::UpdateAll { max } => {
            let outcomes = cursors.update_all(max).await?;
            let rows: Vec<serde_json::Value> = outcomes
                .iter()
                .map(|(driver, outcome)| match outcome {
                    Ok(outcome) => json!({ "driver": driver, "result": outcome }),
                    Err(err) => json!({ "driver": driver, "error": err.to_string() }),
                })
                .collect();
            print_json(&rows)
        }
        Command::Start { driver, min, max } => {
            let outcome = cursors.start(&DriverType::from(driver), min, max).await?;
            print_json(&outcome)
        }
        Command::Abort { driver } => {
            let aborted = cursors.abort(&DriverType::from(driver)).await?;
            if aborted.is_none() {
                info!("no scan in flight");
            }
            print_json(&aborted)
        }
        Command::Requeue { driver, scan_id } => {
            let scan_id: ScanId = scan_id.parse().context("invalid scan id")?;
            let counts = cursors
                .requeue(&DriverType::from(driver), &scan_id)
                .await?;
            print_json(&counts)
        }
        Command::Status { driver } => {
            let status = cursors.status(&DriverType::from(driver)).await?;
            print_json(&status)
        }
        Command::Config | Command::Migrate => Ok(()),
    }
}

async fn run_workers(
    engine: ScanEngine,
    cursors: CursorService,
    args: RunArgs,
) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let worker = Arc::new(ScanWorker::with_cursors(engine, cursors.clone()));
    let mut handles = spawn_worker_pool(worker, shutdown.clone());

    if let Some(interval) = args.update_every {
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => update_all_once(&cursors).await,
                }
            }
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested; draining workers");
    shutdown.cancel();
    for handle in handles {
        if let Err(err) = handle.await {
            warn!("worker task ended abnormally: {err}");
        }
    }
    Ok(())
}

async fn update_all_once(cursors: &CursorService) {
    match cursors.update_all(None).await {
        Ok(outcomes) => {
            for (driver, outcome) in outcomes {
                match outcome {
                    Ok(StartOutcome::NewStarted { scan }) => {
                        info!(%driver, scan_id = %scan.scan_id, "scheduled scan started")
                    }
                    Ok(other) => info!(%driver, outcome = other.label(), "scheduled start skipped"),
                    Err(err) => warn!(%driver, "scheduled start failed: {err}"),
                }
            }
        }
        Err(err) => warn!("scheduled update-all failed: {err}"),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render output")?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn timestamps_accept_rfc3339() {
        let parsed = parse_timestamp("2024-01-01T12:30:00Z").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-01-01T12:30:00+00:00");
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn run_interval_uses_humantime() {
        let cli = Cli::try_parse_from(["catscan", "run", "--update-every", "5m"]).unwrap();
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.update_every, Some(Duration::from_secs(300)))
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
