//! Access control engine service
//!
//! Serves door commands, tenant access status reports and access attempts
//! over HTTP, keeping an append-only access event and audit trail.
//!
//! Module structure:
//! - `domain/` - Core types (Door, AccessEvent, Tenant, Lease, errors)
//! - `io/` - External interfaces (HTTP API, event feed, Prometheus)
//! - `services/` - Business logic (engine, door state machine, lease evaluation)
//! - `infra/` - Infrastructure (Config, Metrics, document store)

use access_engine::infra::{Config, MemoryStore, Metrics};
use access_engine::io::{create_event_feed, start_api_server, ApiState, FeedWriter};
use access_engine::services::{
    create_relock_worker, AccessControlEngine, EngineSettings, SimulatedController,
    StoreDirectory,
};
use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Access control engine for multi-tenant property doors
#[derive(Parser, Debug)]
#[command(name = "access-engine", version, about)]
struct Args {
    /// Path to TOML configuration file (defaults to $CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // RUST_LOG overrides the default INFO level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);
    if args.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("access-engine starting");

    let config = Config::load(args.config.as_deref());
    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        bind_address = %config.bind_address(),
        port = %config.port(),
        command_timeout_ms = %config.command_timeout_ms(),
        cas_retries = %config.cas_retries(),
        relock_enabled = %config.relock_enabled(),
        feed_enabled = %config.feed_enabled(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics = Arc::new(Metrics::new());
    let store = Arc::new(MemoryStore::new());
    if let Some(seed_file) = config.seed_file() {
        store.load_seed(seed_file).context("Failed to seed document store")?;
    }

    let mut engine = AccessControlEngine::new(
        store.clone(),
        Arc::new(StoreDirectory::new(store.clone())),
        Arc::new(SimulatedController::new()),
        metrics.clone(),
        EngineSettings::from_config(&config),
    );

    // Event feed to JSONL file; the writer stops once every sender is dropped
    if config.feed_enabled() {
        let (feed, feed_rx) =
            create_event_feed(config.feed_queue_size(), config.site_id().to_string(), metrics.clone());
        let writer = FeedWriter::new(config.feed_file());
        tokio::spawn(writer.run(feed_rx));

        let metrics_feed = feed.clone();
        let metrics_for_feed = metrics.clone();
        let interval_secs = config.metrics_interval_secs();
        let mut feed_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let summary = metrics_for_feed.report();
                        summary.log();
                        metrics_feed.send_metrics(&summary);
                    }
                    _ = feed_shutdown.changed() => break,
                }
            }
        });

        engine = engine.with_feed(feed);
    } else {
        let metrics_for_log = metrics.clone();
        let interval_secs = config.metrics_interval_secs();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                metrics_for_log.report().log();
            }
        });
    }

    let engine = Arc::new(engine);
    let mut state = ApiState::new(engine.clone(), metrics.clone(), config.site_id().to_string());

    if config.relock_enabled() {
        let (relock_tx, relock_worker) =
            create_relock_worker(engine.clone(), metrics.clone(), config.relock_queue_size());
        tokio::spawn(relock_worker.run());
        state = state.with_relock(relock_tx);
    }

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    start_api_server(config.bind_address(), config.port(), Arc::new(state), shutdown_rx).await?;

    info!("access-engine shutdown complete");
    Ok(())
}
