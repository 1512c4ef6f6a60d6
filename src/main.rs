use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

use notion_sync::config::{self, Config};
use notion_sync::db;
use notion_sync::engine::Engine;
use notion_sync::notion::normalize_id;
use notion_sync::sync::RunOptions;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one sync of every configured database (or the given ones).
    Sync {
        /// Database id or URL; repeatable. Defaults to the configured list.
        #[arg(long = "database")]
        databases: Vec<String>,
        /// Ignore the last watermark and list every record.
        #[arg(long)]
        full: bool,
        /// Skip deleting local records that disappeared remotely.
        #[arg(long)]
        no_deletions: bool,
    },
    /// Process due asset downloads once.
    Assets {
        #[arg(long)]
        batch: Option<usize>,
    },
    /// Periodic sync plus the download worker, until Ctrl-C.
    Daemon,
    /// Print an example configuration.
    Example,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if let Command::Example = args.command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;
    let engine = Engine::from_config(&cfg, pool)?;

    match args.command {
        Command::Sync {
            databases,
            full,
            no_deletions,
        } => {
            let targets = if databases.is_empty() {
                cfg.database_ids()
            } else {
                databases
                    .iter()
                    .map(|d| normalize_id(d).ok_or_else(|| anyhow!("not a Notion id: {}", d)))
                    .collect::<Result<Vec<_>>>()?
            };
            let opts = RunOptions {
                incremental: cfg.sync.incremental && !full,
                check_deletions: cfg.sync.check_deletions && !no_deletions,
            };
            let mut failed = false;
            for database_id in targets {
                match engine.coordinator.run(&database_id, opts).await {
                    Ok(stats) => println!("{}", serde_json::to_string_pretty(&stats)?),
                    Err(err) if err.is_already_running() => warn!(%database_id, "{}", err),
                    Err(err) => {
                        error!(%database_id, "{}", err);
                        failed = true;
                    }
                }
            }
            let stats = engine.controller.stats().await;
            info!(
                requests = stats.total_requests,
                retried = stats.retried,
                quality = stats.quality_score,
                limit = stats.concurrency_limit,
                "controller stats"
            );
            if failed {
                return Err(anyhow!("one or more sync runs failed"));
            }
        }
        Command::Assets { batch } => {
            let batch = batch.unwrap_or(cfg.assets.batch_size);
            engine.queue.recover_stale(cfg.queue_options().stale_after).await?;
            let report = engine.queue.process_batch(batch).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            info!(remaining = engine.queue.queue_size().await?, "download queue");
        }
        Command::Daemon => daemon(&cfg, engine).await?,
        Command::Example => {}
    }
    Ok(())
}

async fn daemon(cfg: &Config, engine: Engine) -> Result<()> {
    let worker = engine.queue.clone().spawn_worker(
        Duration::from_secs(cfg.assets.poll_interval_secs),
        cfg.assets.batch_size,
    );

    let coordinator = engine.coordinator.clone();
    let databases = cfg.database_ids();
    let opts = RunOptions {
        incremental: cfg.sync.incremental,
        check_deletions: cfg.sync.check_deletions,
    };
    let interval = Duration::from_secs(cfg.sync.interval_secs);
    let scheduler = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for database_id in &databases {
                match coordinator.run(database_id, opts).await {
                    Ok(stats) => info!(
                        %database_id,
                        total = stats.total,
                        failed = stats.failed,
                        deleted = stats.deleted,
                        "scheduled sync done"
                    ),
                    Err(err) if err.is_already_running() => info!(%database_id, "{}", err),
                    Err(err) => error!(%database_id, "{}", err),
                }
            }
        }
    });

    info!("daemon started");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    scheduler.abort();
    worker.abort();
    Ok(())
}
