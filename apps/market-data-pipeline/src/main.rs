//! Market Data Pipeline Binary
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-data-pipeline
//! ```
//!
//! # Environment Variables
//!
//! All optional. The most common:
//! - `FEED_URL`: Exchange combined-stream URL
//! - `CACHE_BACKEND`: redis | memory (default: redis)
//! - `REDIS_URL`: Cache connection (default: redis://127.0.0.1:6379/0)
//! - `GLOBAL_THREAD_LIMIT`: Worker pool ceiling (default: 6)
//! - `MARKET_TIMEZONE`: Equities market timezone (default: Asia/Taipei)
//! - `SCHEDULER_DISABLED_JOBS`: Comma-separated job names to skip
//! - `BASE_CURRENCY`: Always-subscribed reporting currency (default: USD)
//! - `HEALTH_PORT`: Health and metrics HTTP port (default: 8082)
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`
//! - `RUST_LOG`: Log filter

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_data_pipeline::application::ports::{CacheStore, FeedControl, TimeSeriesStore};
use market_data_pipeline::application::services::backfill::BackfillService;
use market_data_pipeline::application::services::bridge::FeedBridge;
use market_data_pipeline::application::services::currency::CurrencyRefresher;
use market_data_pipeline::application::services::equities::EquitiesPoller;
use market_data_pipeline::application::services::ingest::TickIngestor;
use market_data_pipeline::application::services::market_hours::MarketHours;
use market_data_pipeline::application::services::progress::ProgressTracker;
use market_data_pipeline::infrastructure::cache::{InMemoryCacheStore, RedisCacheStore};
use market_data_pipeline::infrastructure::config::CacheBackend;
use market_data_pipeline::infrastructure::exchange::{StreamConnectionManager, WebSocketConnector};
use market_data_pipeline::infrastructure::scheduler::{PipelineJobs, PipelineScheduler};
use market_data_pipeline::infrastructure::sources::{
    BinanceHistorySource, ExchangeRateSource, TwseHistorySource, TwseQuoteSource, http_client,
};
use market_data_pipeline::infrastructure::telemetry;
use market_data_pipeline::infrastructure::timeseries::InMemoryTimeSeriesStore;
use market_data_pipeline::{
    Asset, CacheMaterializer, HealthServer, HealthServerState, PipelineConfig,
    SubscriptionCoordinator, SubscriptionRegistry, WorkerPool, init_metrics,
};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of the subscription change channel.
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// How long to wait for background loops after cancellation.
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider already installed");
    }

    load_dotenv();

    let telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting market data pipeline");

    let _metrics_handle = init_metrics().context("failed to install metrics recorder")?;

    let config = PipelineConfig::from_env()?;
    log_config(&config);

    let result = run(config).await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "Pipeline stopped with error");
    }

    tracing::info!("Market data pipeline stopped");
    drop(telemetry_guard);
    result
}

#[allow(clippy::too_many_lines)]
async fn run(config: PipelineConfig) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let max_attempts = config.retry.max_attempts;

    // Stores
    let registry = Arc::new(SubscriptionRegistry::new());
    let store: Arc<dyn TimeSeriesStore> = Arc::new(InMemoryTimeSeriesStore::new());
    let cache: Arc<dyn CacheStore> = match config.cache.backend {
        CacheBackend::Redis => Arc::new(
            RedisCacheStore::connect(&config.cache.redis_url)
                .await
                .context("failed to connect to Redis")?,
        ),
        CacheBackend::Memory => Arc::new(InMemoryCacheStore::new()),
    };

    // Execution support
    let pool = WorkerPool::new(config.pool.ceiling);
    let progress = Arc::new(ProgressTracker::new());
    let materializer = Arc::new(CacheMaterializer::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        pool.clone(),
        config.cache.ttl,
    ));

    // Exchange feed
    let (tick_tx, tick_rx) = mpsc::channel(config.feed.tick_buffer);
    let ingestor = Arc::new(TickIngestor::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        max_attempts,
    ));
    let (manager, feed) = StreamConnectionManager::new(
        config.feed.clone(),
        Arc::new(WebSocketConnector::new()),
        Arc::clone(&registry),
        tick_tx,
        cancel.clone(),
    );
    let feed_control: Arc<dyn FeedControl> = Arc::new(feed.clone());

    // Sources
    let client = http_client(config.sources.request_timeout)?;
    let poller = Arc::new(EquitiesPoller::new(
        Arc::clone(&registry),
        Arc::new(TwseQuoteSource::new(client.clone())),
        Arc::clone(&store),
        MarketHours::default().with_timezone(config.scheduler.market_timezone),
        max_attempts,
        config.scheduler.immediately_update_stock_tw,
    ));
    let backfill = Arc::new(BackfillService::new(
        Arc::clone(&store),
        Arc::new(BinanceHistorySource::new(client.clone())),
        Arc::new(TwseHistorySource::new(client.clone())),
        Arc::clone(&registry),
        Arc::clone(&progress),
        config.subscription.retention,
        max_attempts,
    ));
    let currency = Arc::new(CurrencyRefresher::new(
        Arc::new(ExchangeRateSource::new(client)),
        Arc::clone(&store),
        Arc::clone(&registry),
        config.subscription.base_currency.clone(),
        max_attempts,
    ));

    // Subscription fan-out
    let coordinator = Arc::new(SubscriptionCoordinator::new(
        Arc::clone(&registry),
        CHANGE_CHANNEL_CAPACITY,
    ));
    let bridge = Arc::new(FeedBridge::new(
        Arc::clone(&feed_control),
        Arc::clone(&poller),
        Arc::clone(&registry),
    ));

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(manager.run()));
    tasks.push(tokio::spawn({
        let ingestor = Arc::clone(&ingestor);
        let cancel = cancel.clone();
        async move {
            let stats = ingestor.run(tick_rx, cancel).await;
            tracing::info!(?stats, "Tick ingestor stopped");
        }
    }));
    tasks.push(tokio::spawn(
        Arc::clone(&bridge).run(coordinator.changes(), cancel.clone()),
    ));
    tasks.push(tokio::spawn(Arc::clone(&backfill).run_consumer(
        coordinator.changes(),
        pool.clone(),
        cancel.clone(),
    )));

    coordinator.pin(&Asset::currency(
        config.subscription.base_currency_asset_id,
        config.subscription.base_currency.clone(),
    ));

    // Health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION"),
        Arc::clone(feed.status()),
        Arc::clone(&registry),
        pool.clone(),
        Arc::clone(&materializer),
        Arc::clone(&progress),
    ));
    let health_server = HealthServer::new(config.server.health_port, health_state, cancel.clone());
    tasks.push(tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    }));

    // Scheduler
    let mut scheduler = PipelineScheduler::new(pool.clone()).await?;
    let jobs = PipelineJobs {
        poller,
        feed: Arc::clone(&feed_control),
        backfill,
        currency,
    };
    let registered = scheduler.register_pipeline(&jobs, &config.scheduler).await?;
    scheduler.start().await?;

    tracing::info!(jobs = registered, "Market data pipeline ready");

    await_shutdown(&cancel).await;

    // Shutdown, in dependency order
    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!(error = %e, "Scheduler shutdown failed");
    }
    feed.close();

    let drained = pool.shutdown(config.pool.drain_timeout).await;
    if !drained {
        tracing::warn!(
            timeout_secs = config.pool.drain_timeout.as_secs(),
            "Worker pool drain timed out"
        );
    }

    let failed_entries = materializer.fail_in_flight().await;
    let failed_tasks = progress.fail_in_progress();
    tracing::info!(failed_entries, failed_tasks, "Marked interrupted work failed");

    for task in tasks {
        if tokio::time::timeout(TASK_JOIN_TIMEOUT, task).await.is_err() {
            tracing::warn!("Background task did not stop in time");
        }
    }

    Ok(())
}

/// Load `.env` from the working directory or the nearest ancestor with one.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        for dir in cwd.ancestors().skip(1) {
            let env_path = dir.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
        }
    }
}

fn log_config(config: &PipelineConfig) {
    tracing::info!(
        feed_channel = %config.feed.channel,
        cache_backend = ?config.cache.backend,
        pool_ceiling = config.pool.ceiling,
        market_timezone = %config.scheduler.market_timezone,
        base_currency = %config.subscription.base_currency,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(feed_url = %config.feed.url, redis = ?config.cache.redis_url, "Endpoints");
}

/// Wait for SIGINT or SIGTERM, then cancel the token.
async fn await_shutdown(cancel: &CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    cancel.cancel();
}
