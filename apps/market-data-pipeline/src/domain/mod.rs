//! Domain Layer - Core market data types and subscription bookkeeping.
//!
//! This layer holds the types shared by every integration point: asset
//! identity, normalized ticks, cache entry status and keys, and the
//! subscription registry. Nothing here performs I/O.

/// Asset identity across crypto pairs, local equities and currencies.
pub mod asset;

/// Cache entry status, keys and client-ready kline records.
pub mod cache;

/// Normalized ticks and raw time-series records.
pub mod market_data;

/// Subscription tracking with per-asset subscriber sets.
pub mod subscription;
