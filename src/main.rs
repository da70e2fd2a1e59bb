use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use tallyd::agent::{Agent, Uplink};
use tallyd::clock::Clock;
use tallyd::collector::http::{self, HttpState};
use tallyd::collector::query::QueryEngine;
use tallyd::collector::{self, Collector, CollectorHandle, ServiceOptions};
use tallyd::config::{Config, StoreConfig};
use tallyd::export::health::HealthMetrics;
use tallyd::migrate::{ClickHouseMigrator, MigrationStatus};
use tallyd::store::{ClickHouseStore, Store};
use tallyd::transport::{ListenConfig, SubmissionClient};

/// Two-tier time-series counter aggregation.
#[derive(Parser)]
#[command(name = "tallyd", about)]
struct Cli {
    /// Path to the YAML configuration file. Built-in defaults are used
    /// when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity (trace, debug, info, warn, error). Overrides
    /// `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the local aggregator and ship snapshots to a remote collector.
    Agent,
    /// Run the collector: snapshot ingress, window cache and chart queries.
    Collector,
    /// Run an agent and a collector in one process.
    Standalone,
    /// Submit a value to a running agent.
    Send {
        #[arg(long)]
        key: u32,
        #[arg(long, allow_negative_numbers = true)]
        value: i64,
        /// Number of times to submit the value.
        #[arg(long, default_value_t = 1)]
        count: u32,
        /// Send over UDP to this address instead of the configured socket.
        #[arg(long, conflicts_with = "socket")]
        udp: Option<String>,
        /// Send to this unix socket instead of the configured socket.
        #[arg(long)]
        socket: Option<PathBuf>,
    },
    /// Manage the ClickHouse schema.
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
    /// Print version information and exit.
    Version,
}

#[derive(Subcommand, Clone, Copy)]
enum MigrateAction {
    /// Apply pending migrations.
    Up,
    /// Roll back the most recent migration.
    Down,
    /// Print the applied schema version.
    Status,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Commit hash from the `GIT_COMMIT` build env, or "unknown".
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

    if let Command::Version = cli.command {
        println!("tallyd {}", version::full());
        return Ok(());
    }

    let cfg = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let command = match cli.command {
        Command::Send {
            key,
            value,
            count,
            udp,
            socket,
        } => {
            let target = match (udp, socket) {
                (Some(addr), _) => ListenConfig::Udp { addr },
                (None, Some(path)) => ListenConfig::Unix { path },
                (None, None) => cfg.agent.listen.clone(),
            };
            return send(&target, key, value, count);
        }
        other => other,
    };

    info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting tallyd",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(command, cfg))
}

async fn run(command: Command, cfg: Config) -> Result<()> {
    match command {
        Command::Agent => run_agent(cfg, shutdown_signal()?).await,
        Command::Collector => run_collector(cfg, shutdown_signal()?).await,
        Command::Standalone => run_standalone(cfg, shutdown_signal()?).await,
        Command::Migrate { action } => migrate(&cfg, action).await,
        Command::Send { .. } | Command::Version => Ok(()),
    }
}

/// Returns a token cancelled on SIGINT or SIGTERM.
fn shutdown_signal() -> Result<CancellationToken> {
    use tokio::signal::unix::{signal, SignalKind};

    let ctx = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;

    let token = ctx.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
        token.cancel();
    });

    Ok(ctx)
}

async fn start_health(cfg: &Config) -> Result<Arc<HealthMetrics>> {
    let health = Arc::new(HealthMetrics::new(&cfg.health.addr)?);
    health.start().await?;
    Ok(health)
}

async fn run_agent(cfg: Config, ctx: CancellationToken) -> Result<()> {
    cfg.validate_agent()?;

    let health = start_health(&cfg).await?;
    let uplink = Uplink::http(&cfg.agent.uplink)?;
    let agent = Arc::new(Agent::new(
        &cfg.agent,
        cfg.alignment()?,
        Clock::system(),
        Some(Arc::clone(&health)),
    ));

    let result = agent.run(uplink, ctx).await;
    health.stop().await?;
    result
}

async fn run_collector(cfg: Config, ctx: CancellationToken) -> Result<()> {
    let health = start_health(&cfg).await?;
    let service = CollectorService::start(&cfg, &health, &ctx).await?;

    ctx.cancelled().await;

    service.join().await;
    health.stop().await?;
    Ok(())
}

/// Agent and collector in one process. The collector outlives the agent so
/// the agent's final flush is still merged and persisted.
async fn run_standalone(cfg: Config, ctx: CancellationToken) -> Result<()> {
    let health = start_health(&cfg).await?;

    let collector_ctx = CancellationToken::new();
    let service = CollectorService::start(&cfg, &health, &collector_ctx).await?;

    let agent = Arc::new(Agent::new(
        &cfg.agent,
        cfg.alignment()?,
        Clock::system(),
        Some(Arc::clone(&health)),
    ));
    let result = agent
        .run(Uplink::Channel(service.handle.clone()), ctx)
        .await;

    collector_ctx.cancel();
    service.join().await;
    health.stop().await?;
    result
}

/// Running collector tasks.
struct CollectorService {
    handle: CollectorHandle,
    workers: JoinHandle<()>,
    api: JoinHandle<()>,
}

impl CollectorService {
    async fn start(
        cfg: &Config,
        health: &Arc<HealthMetrics>,
        ctx: &CancellationToken,
    ) -> Result<Self> {
        let store = Store::open(&cfg.store, Some(Arc::clone(health))).await?;

        if let (Store::ClickHouse(ch), StoreConfig::Clickhouse(ch_cfg)) = (&store, &cfg.store) {
            if ch_cfg.migrations.enabled {
                ClickHouseMigrator::new(ch.pool().clone())
                    .up()
                    .await
                    .context("running ClickHouse migrations")?;
            }
        }

        let layout = cfg.window_layout()?;
        info!(
            store = store.name(),
            alignment = layout.alignment.secs(),
            slots = layout.slots(),
            codec = %cfg.collector.pipeline().describe(),
            "starting collector",
        );

        let store = Arc::new(store);
        let collector = Arc::new(Collector::new(
            layout,
            Clock::system(),
            Some(Arc::clone(health)),
        ));

        let (handle, workers) = collector::spawn(
            Arc::clone(&collector),
            Arc::clone(&store),
            ServiceOptions::from(&cfg.collector),
            ctx.clone(),
        );

        let state = Arc::new(HttpState {
            handle: handle.clone(),
            engine: Arc::new(QueryEngine::new(collector, store, &cfg.collector.query)),
            pipeline: cfg.collector.pipeline(),
            health: Some(Arc::clone(health)),
        });
        let api = http::serve(&cfg.collector.listen_addr, state, ctx.clone()).await?;

        Ok(Self {
            handle,
            workers,
            api,
        })
    }

    async fn join(self) {
        if let Err(e) = self.api.await {
            error!(error = %e, "collector API task failed");
        }
        if let Err(e) = self.workers.await {
            error!(error = %e, "collector workers failed");
        }
    }
}

async fn migrate(cfg: &Config, action: MigrateAction) -> Result<()> {
    let StoreConfig::Clickhouse(ch_cfg) = &cfg.store else {
        bail!("migrations require `store.kind: clickhouse`");
    };

    let store = ClickHouseStore::connect(ch_cfg, None).await?;
    let migrator = ClickHouseMigrator::new(store.pool().clone());

    let status = match action {
        MigrateAction::Up => migrator.up().await?,
        MigrateAction::Down => migrator.down().await?,
        MigrateAction::Status => migrator.status().await?,
    };

    println!(
        "schema version {} of {}{}",
        status.version,
        MigrationStatus::latest(),
        if status.dirty { " (dirty)" } else { "" },
    );
    Ok(())
}

fn send(target: &ListenConfig, key: u32, value: i64, count: u32) -> Result<()> {
    let client = SubmissionClient::connect(target)?;
    for _ in 0..count {
        client
            .send(key, value)
            .with_context(|| format!("sending to {target}"))?;
    }
    info!(key, value, count, target = %target, "submitted");
    Ok(())
}
