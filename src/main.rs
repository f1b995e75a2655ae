// vinted-watcher - marketplace monitor for saved searches
//
// The watcher scans a second-hand-clothing marketplace for newly listed items
// matching saved searches and dispatches each discovery exactly once to
// Telegram.
//
// Architecture:
// - Proxy pool: outbound identities, validated and rotated
// - Token pool: (bearer, proxy, User-Agent) sessions, one slot per worker
// - Query workers: one scan loop per saved search (three for priority)
// - Ingestion: dedupe, persist, format, enqueue for the notifier
// - Restart governor: fleet-wide failure counters, external restart chain
// - Admin surface (axum) and Telegram adapter at the boundary
// - mpsc channels connect the fleet to ingestion and the notifier

mod catalog;
mod cli;
mod config;
mod events;
mod governor;
mod ingest;
mod item;
mod logging;
mod proxy_pool;
mod startup;
mod store;
mod telegram;
mod token_pool;
mod web;
mod worker;

use anyhow::{Context, Result};
use catalog::CatalogClient;
use chrono::Utc;
use config::Config;
use governor::RestartGovernor;
use ingest::IngestPipeline;
use logging::{BufferLogLayer, LogBuffer};
use proxy_pool::ProxyPool;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use store::Store;
use token_pool::TokenPool;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use worker::{FleetStats, WorkerContext};

/// Hard ceiling on pool size, above the largest realistic fleet
const MAX_POOL_SIZE: usize = 100;

#[tokio::main]
async fn main() -> Result<()> {
    // Handle CLI subcommands first; exit early if one ran
    if cli::handle_cli() {
        return Ok(());
    }

    let config = Config::from_env();

    // Logs go to stdout and into the ring buffer behind GET /api/logs
    // Precedence: RUST_LOG env var > config level
    let log_buffer = LogBuffer::new();
    let default_filter = format!("vinted_watcher={}", config.log_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(BufferLogLayer::new(log_buffer.clone()))
        .init();

    startup::print_startup(&config);
    startup::log_startup(&config);

    let tunables = config.tunables.clone();

    // 1. Open the store; schema and migrations are idempotent
    let store = Store::open(&config.database_path).context("Failed to open store")?;

    // 2. Fresh counters for this run
    let started_at = Utc::now();
    store.reset_api_requests()?;
    store.set_parameter("bot_start_time", &started_at.to_rfc3339())?;

    // 3. Enumerate queries and size the fleet: 1 worker per normal query,
    //    3 staggered workers per priority query
    let queries = store.get_queries()?;
    let fleet_size = worker::worker_count(&queries);
    tracing::info!(
        "{} queries ({} priority) -> {} workers",
        queries.len(),
        queries.iter().filter(|q| q.priority).count(),
        fleet_size
    );

    // Shutdown signal observed by every task at its wait points
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // 4. Pools: proxies first, then pre-warmed sessions (one per worker)
    let proxy_pool = Arc::new(ProxyPool::new(store.clone(), tunables.clone()));
    let token_pool = Arc::new(TokenPool::new(
        proxy_pool.clone(),
        tunables.clone(),
        fleet_size,
        MAX_POOL_SIZE,
    ));
    if fleet_size > 0 {
        token_pool.prewarm().await;
    }

    // Channels: workers -> ingestion -> notifier
    let (items_tx, items_rx) = mpsc::channel(tunables.channel_capacity);
    let (notify_tx, notify_rx) = mpsc::channel(tunables.channel_capacity);

    // Restart governor and its action chain
    let (restart_governor, restart_rx) = RestartGovernor::new(store.clone(), tunables.clone());
    let restart_actions = governor::default_restart_actions(&config, &store);
    tokio::spawn(governor::run_restart_task(
        restart_governor.clone(),
        restart_rx,
        restart_actions,
    ));

    // 5. Spawn the worker fleet
    let fleet_stats = FleetStats::default();
    let worker_ctx = WorkerContext {
        store: store.clone(),
        sessions: token_pool.clone(),
        catalog: Arc::new(CatalogClient::new(store.clone(), tunables.clone())),
        governor: restart_governor.clone(),
        items_tx,
        tunables: tunables.clone(),
        stats: fleet_stats.clone(),
    };
    let worker_handles = worker::spawn_workers(&worker_ctx, &queries, &shutdown_rx);

    // 6. Ingestion consumer on its fast tick, plus a monitor that logs live
    //    configuration changes at a coarser interval
    let ingest = IngestPipeline::new(
        store.clone(),
        items_rx,
        notify_tx,
        tunables.clone(),
        shutdown_rx.clone(),
    );
    let ingest_handle = tokio::spawn(ingest.run());
    tokio::spawn(monitor_config(store.clone(), shutdown_rx.clone()));

    // 7. Notifier adapter: sender + command poller, or a discarding drain
    //    when no credentials are configured
    let telegram_enabled = Arc::new(AtomicBool::new(true));
    match telegram::TelegramClient::from_config(&config, &store) {
        Some(client) => {
            let handler = telegram::CommandHandler::new(
                store.clone(),
                format!("http://{}", config.bind_addr),
            );
            tokio::spawn(telegram::run_sender(
                client.clone(),
                notify_rx,
                telegram_enabled.clone(),
                shutdown_rx.clone(),
            ));
            tokio::spawn(telegram::run_command_poller(
                client,
                handler,
                telegram_enabled.clone(),
                shutdown_rx.clone(),
            ));
        }
        None => {
            tracing::warn!(
                "Telegram credentials not configured - notifications will be discarded"
            );
            tokio::spawn(discard_notifications(notify_rx, shutdown_rx.clone()));
        }
    }

    // Admin surface
    let app_state = web::AppState {
        store,
        config,
        log_buffer,
        governor: restart_governor,
        proxy_pool,
        token_pool,
        fleet_stats,
        telegram_enabled,
        started_at,
    };
    let web_handle = tokio::spawn(web::run_web(app_state, shutdown_rx));

    // Run until interrupted
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    // Flip the signal; workers stop before their next sleep returns, the
    // notifier drains a bounded tail, the web server closes its listener
    let _ = shutdown_tx.send(true);

    for handle in worker_handles {
        let _ = handle.await;
    }
    let _ = ingest_handle.await;
    if let Ok(Err(e)) = web_handle.await {
        tracing::error!("Admin surface error: {:?}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Log live-config changes so operators can see reconfiguration taking hold.
/// Workers pick the values up themselves on their next cycle.
async fn monitor_config(store: Store, mut shutdown: watch::Receiver<bool>) {
    let mut last_delay = store.get_int_parameter("query_refresh_delay", 60).unwrap_or(60);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {}
            _ = shutdown.changed() => break,
        }
        let delay = store.get_int_parameter("query_refresh_delay", 60).unwrap_or(last_delay);
        if delay != last_delay {
            tracing::info!(
                "Query refresh delay changed from {} to {} seconds",
                last_delay,
                delay
            );
            last_delay = delay;
        }
    }
}

/// Consume and drop notifications when no notifier is configured, so the
/// ingestion pipeline never backs up
async fn discard_notifications(
    mut notify_rx: mpsc::Receiver<events::Notification>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            message = notify_rx.recv() => {
                if message.is_none() {
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
