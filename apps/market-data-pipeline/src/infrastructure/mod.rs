//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the application ports, plus the process
//! plumbing: configuration, scheduling, telemetry, metrics and health.

/// Cache store adapters (Redis, in-memory).
pub mod cache;

/// Configuration from environment variables.
pub mod config;

/// Exchange WebSocket feed and connection manager.
pub mod exchange;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics recorder.
pub mod metrics;

/// Cron scheduler for periodic jobs.
pub mod scheduler;

/// HTTP quote, history and exchange-rate sources.
pub mod sources;

/// Logging and OpenTelemetry tracing.
pub mod telemetry;

/// In-memory time-series store.
pub mod timeseries;
