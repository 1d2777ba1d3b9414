//! Application Layer - Services and port definitions.
//!
//! Services coordinate subscriptions, polling, backfill and cache
//! materialization. Ports define the external collaborators they drive.

/// Port interfaces for external systems (stores, sources, feed).
pub mod ports;

/// Application services.
pub mod services;
