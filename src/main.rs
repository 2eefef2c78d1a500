use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use statespan::config::Config;
use statespan::export::health::HealthMetrics;
use statespan::export::WarehouseWriter;
use statespan::migrate::{ClickHouseMigrator, Migrator};
use statespan::pipeline;

/// Warehouse ETL runner that reconstructs state intervals from ordered
/// change-event streams.
#[derive(Parser)]
#[command(name = "statespan", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,

    /// Manage warehouse schema migrations.
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Apply all pending migrations.
    Up,
    /// Roll back the last applied migration.
    Down,
    /// Show the current migration version.
    Status,
}

/// Build-time version info, injected via RUSTFLAGS or build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Target OS.
    pub fn target_os() -> &'static str {
        std::env::consts::OS
    }

    /// Target architecture.
    pub fn target_arch() -> &'static str {
        std::env::consts::ARCH
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            target_os(),
            target_arch(),
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("statespan {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    // Config is required for everything past `version`.
    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting statespan",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Some(Command::Migrate { action }) => rt.block_on(run_migrate(cfg, action)),
        _ => rt.block_on(run(cfg)),
    }
}

async fn run_migrate(cfg: Config, action: MigrateAction) -> Result<()> {
    let mut writer = WarehouseWriter::new(cfg.warehouse.clone());
    writer.start().await?;

    let pool = writer.pool().context("warehouse writer not started")?;
    let migrator = ClickHouseMigrator::new(pool.clone());

    match action {
        MigrateAction::Up => migrator.up().await?,
        MigrateAction::Down => migrator.down().await?,
        MigrateAction::Status => {
            let (version, dirty) = migrator.status().await?;
            println!("version: {version}, dirty: {dirty}");
        }
    }

    writer.stop().await?;
    Ok(())
}

async fn run(cfg: Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // Connect to the warehouse.
    let mut writer = WarehouseWriter::new(cfg.warehouse.clone());
    writer.start().await?;

    // Apply pending migrations before any stage touches its destination.
    if cfg.warehouse.migrations.enabled {
        let pool = writer.pool().context("warehouse writer not started")?;
        ClickHouseMigrator::new(pool.clone())
            .up()
            .await
            .context("applying migrations")?;
    }

    // Optional health/metrics server.
    let health = if cfg.health.enabled {
        let metrics =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        metrics.start().await.context("starting health server")?;
        metrics.warehouse_connected.set(1.0);
        Some(metrics)
    } else {
        None
    };

    // Run the stages, racing against the shutdown signal.
    let mut shutdown_rx = shutdown_rx;
    let result = tokio::select! {
        result = pipeline::run_all(&cfg, &writer, health.clone()) => result,
        _ = &mut shutdown_rx => {
            tracing::warn!("interrupted before all stages completed");
            Ok(())
        }
    };

    // Graceful shutdown.
    if let Some(health) = health {
        health.warehouse_connected.set(0.0);
        health.stop().await?;
    }
    writer.stop().await?;

    tracing::info!("statespan stopped");

    result
}
