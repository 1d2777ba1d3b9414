//! Application Services
//!
//! - `coordinator`: subscription record and change notifications
//! - `bridge`: routes changes to the feed and the equities poller
//! - `equities`, `market_hours`: polling for the equities market
//! - `ingest`: feed ticks into the time-series store
//! - `materializer`: asynchronous cache population
//! - `backfill`, `currency`: history and rate refresh
//! - `retry`, `worker_pool`, `progress`: execution support

pub mod backfill;
pub mod bridge;
pub mod coordinator;
pub mod currency;
pub mod equities;
pub mod ingest;
pub mod market_hours;
pub mod materializer;
pub mod progress;
pub mod retry;
pub mod worker_pool;
