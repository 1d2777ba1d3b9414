#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Data Pipeline - Ingestion and Cache Materialization
//!
//! Keeps one streaming connection to the crypto exchange for every
//! subscribed pair, polls the local equities market during trading hours,
//! refreshes exchange rates, backfills daily history, and materializes
//! time-series queries into status-tagged cache entries.
//!
//! # Layers (inside to outside)
//!
//! - **Domain**: assets, ticks, cache keys and the subscription registry
//! - **Application**: ports and services (coordinator, feed bridge,
//!   equities poller, ingestor, materializer, backfill, worker pool)
//! - **Infrastructure**: exchange feed, Redis and in-memory stores, HTTP
//!   sources, cron scheduler, config, telemetry, metrics, health
//!
//! # Data Flow
//!
//! ```text
//! subscribe/unsubscribe
//!        |
//!        v
//!  SubscriptionCoordinator --changes--> FeedBridge ----> StreamConnectionManager <--ws--> exchange
//!        |                                  |                      |
//!        |                                  v                      v ticks
//!        +--changes--> BackfillService   EquitiesPoller       TickIngestor
//!                           |               |                      |
//!                           +---------------+----> TimeSeriesStore <+
//!                                                       |
//!                                               CacheMaterializer --> CacheStore
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core market data types with no I/O.
pub mod domain;

/// Application layer - Services and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::asset::{Asset, AssetClass, AssetId, DEFAULT_CHANNEL, QueryKind, TwMarket, UserId};
pub use domain::cache::{CacheEntry, CacheKey, CacheStatus, KlinePoint};
pub use domain::market_data::Tick;
pub use domain::subscription::{SubscribeOutcome, SubscriptionRegistry, UnsubscribeOutcome};

// Services
pub use application::services::coordinator::{SubscriptionChange, SubscriptionCoordinator};
pub use application::services::materializer::{CacheMaterializer, MaterializeOutcome};
pub use application::services::worker_pool::{PoolError, WorkerPool};

// Infrastructure config
pub use infrastructure::config::{ConfigError, PipelineConfig};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
