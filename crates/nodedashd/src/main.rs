//! nodedash daemon - serves node status, live events and self-update.

use anyhow::{Context, Result};
use clap::Parser;
use nodedash_common::config::CONFIG_PATH;
use nodedash_common::{Config, UpdateStatus, VERSION};
use nodedashd::{
    logging, server, AppState, CommandUpdater, DaemonLifecycle, Database, EventHub, Janitor,
    Lifecycle, ShutdownController, ShutdownTimings, StatusStore, UpdateOrchestrator,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "nodedashd")]
#[command(about = "nodedash daemon - node status, live events and self-update", long_about = None)]
#[command(version = VERSION)]
struct Cli {
    /// Config file
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Listen address (overrides [server] bind)
    #[arg(long)]
    bind: Option<String>,

    /// SQLite database path (overrides [database] path)
    #[arg(long)]
    database: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging needs the configured level, so report load problems afterwards
    let (mut config, load_error) = match Config::load_from_path(&cli.config) {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };
    logging::init(&config.log_level);
    if let Some(e) = load_error {
        warn!(
            "Config not loaded from {}, using defaults: {}",
            cli.config.display(),
            e
        );
    }
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if let Some(database) = cli.database {
        config.database.path = database;
    }

    info!("nodedashd v{} starting", VERSION);

    let db = Arc::new(
        Database::open_at(&config.database.path)
            .await
            .context("Failed to open database")?,
    );
    let hub = Arc::new(EventHub::from_config(&config.hub));
    let status = Arc::new(StatusStore::new());
    status.set(UpdateStatus::idle(VERSION, "")).await;

    let shutdown = ShutdownController::new();
    let lifecycle = Arc::new(DaemonLifecycle::new(Arc::clone(&db), shutdown.clone()));

    let janitor = Janitor::from_config(db.clone(), &config.janitor).with_hub(Arc::clone(&hub));
    let stale_after = janitor.threshold();
    lifecycle.attach_janitor(janitor.start()).await;

    let orchestrator = Arc::new(
        UpdateOrchestrator::new(
            Arc::clone(&status),
            Arc::clone(&hub),
            Arc::new(CommandUpdater::from_config(&config.update)),
            db.clone(),
            lifecycle.clone(),
        )
        .with_timings(ShutdownTimings::from_config(&config.update))
        .with_channel(config.update.channel.clone()),
    );

    {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            if let Err(e) = orchestrator.check_for_updates().await {
                warn!("Initial update check failed: {:#}", e);
            }
        });
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.trigger("interrupt");
            }
        });
    }

    let heartbeat = config
        .hub
        .heartbeat()
        .map(|every| server::spawn_heartbeat(Arc::clone(&hub), every, shutdown.signal()));

    let state = AppState::new(
        status,
        hub,
        orchestrator,
        db,
        shutdown.clone(),
    )
    .with_stale_after(stale_after)
    .with_mailbox_capacity(config.hub.mailbox_capacity);

    let served = server::run(state, &config.server.bind, shutdown.signal()).await;

    // Listener failures still tear the rest down
    shutdown.trigger("listener stopped");
    if let Some(heartbeat) = heartbeat {
        let _ = heartbeat.await;
    }
    lifecycle.shutdown().await;

    info!("nodedashd stopped");
    served
}
