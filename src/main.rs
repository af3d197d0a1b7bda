use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, EnvFilter};

use pingtrack::app::App;
use pingtrack::config::{Config, StorageBackend};
use pingtrack::migrate::ClickHouseSchema;
use pingtrack::store::{ClickHouseStore, Store};

/// Game-server player-count tracker.
#[derive(Parser)]
#[command(name = "pingtrack", about)]
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

    /// Manage the ClickHouse schema.
    Migrate {
        #[arg(value_enum)]
        direction: MigrateDirection,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum MigrateDirection {
    Up,
    Down,
    Status,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("pingtrack {}", version::full());
        return Ok(());
    }

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    // --log-level wins over the config file unless left at its default.
    let level = if cli.log_level == "info" {
        cfg.log_level.clone()
    } else {
        cli.log_level.clone()
    };

    let filter =
        EnvFilter::try_new(&level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Some(Command::Migrate { direction }) => rt.block_on(migrate(cfg, direction)),
        _ => {
            tracing::info!(
                version = version::RELEASE,
                commit = version::git_commit(),
                "starting pingtrack",
            );
            rt.block_on(run(cfg))
        }
    }
}

async fn run(cfg: Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "registering SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = terminate => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let mut app = App::new(cfg)?;
    let cancel = app.cancellation_token();

    if let Err(e) = app.start().await {
        let _ = app.stop().await;
        return Err(e);
    }

    // Either a signal or a fatal storage failure ends the run.
    tokio::select! {
        _ = shutdown_rx => {}
        _ = cancel.cancelled() => {
            tracing::error!("fatal failure, shutting down");
        }
    }

    app.stop().await
}

async fn migrate(cfg: Config, direction: MigrateDirection) -> Result<()> {
    if cfg.storage.backend != StorageBackend::Clickhouse {
        bail!("migrations only apply to the clickhouse storage backend");
    }

    let store = ClickHouseStore::new(cfg.storage.clickhouse.clone());
    store.initialize().await.context("connecting to ClickHouse")?;

    let pool = store
        .pool()
        .context("ClickHouse pool missing after initialize")?;
    let schema = ClickHouseSchema::new(pool);

    let result = match direction {
        MigrateDirection::Up => schema.up().await,
        MigrateDirection::Down => schema.down().await,
        MigrateDirection::Status => schema.status().await.map(|status| {
            println!(
                "version: {} (latest {}), dirty: {}, pending: {}",
                status.version,
                status.latest,
                status.dirty,
                status.pending(),
            );
        }),
    };

    store.close().await?;

    result
}
