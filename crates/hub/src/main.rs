mod app;
mod automation;
mod command;
mod config;
mod db;
mod events;
mod ingest;
mod link;
mod settings;
mod state;
mod sync;
mod telemetry;
mod web;

use anyhow::{Context, Result};
use std::env;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use app::AppContext;
use db::Db;
use events::EventBus;
use link::{Link, SerialConnector};
use sync::SyncHandle;

/// Broadcast capacity for hardware events.
const EVENT_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&cfg.db_url).await?;
    db.migrate().await?;
    let seeded = db.seed_settings(&cfg.settings).await?;
    info!(seeded, "db ready");

    // ── Shared collaborators ────────────────────────────────────────
    let link = Link::new(SerialConnector::new(&cfg.serial));
    let events = EventBus::new(EVENT_CAPACITY);
    let (sync_handle, sync_rx) = SyncHandle::channel(cfg.sync.queue_depth);
    let settle = cfg.sync.settle_delay();
    let ctx = AppContext::new(cfg, db, link, events, sync_handle);

    ctx.state
        .write()
        .await
        .record_system("hub started".to_string());

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    // Subscribers first, so the first LinkUp is not missed.
    tasks.push(tokio::spawn(events::record_status(
        ctx.state.clone(),
        ctx.events.subscribe(),
    )));
    tasks.push(tokio::spawn(sync::resync_on_link_up(
        ctx.events.subscribe(),
        ctx.sync.clone(),
        settle,
        stop_rx.clone(),
    )));
    tasks.push(tokio::spawn(sync::run_worker(
        ctx.settings_sync(),
        ctx.db.clone(),
        sync_rx,
    )));

    // ── Hardware loops ──────────────────────────────────────────────
    tasks.push(tokio::spawn(ctx.ingestor().run(stop_rx.clone())));
    tasks.push(tokio::spawn(ctx.automation().run(stop_rx.clone())));

    // ── Web server ──────────────────────────────────────────────────
    let web = tokio::spawn(web::serve(ctx.clone(), stop_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");
    stop_tx.send_replace(true);

    match web.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("web: {e:#}"),
        Err(e) => error!("web task panicked: {e}"),
    }

    // The status recorder and sync worker run until the last event bus and
    // sync handles are gone.
    drop(ctx);
    for task in tasks {
        if let Err(e) = task.await {
            error!("task panicked: {e}");
        }
    }

    info!("hub stopped");
    Ok(())
}
