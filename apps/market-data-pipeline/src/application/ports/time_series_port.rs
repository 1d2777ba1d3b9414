//! Time-Series Store Port (Driven Port)
//!
//! Write path accepts normalized tick batches tagged by asset. Read path
//! returns `(timestamp, field, value)` records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::asset::{Asset, QueryKind};
use crate::domain::market_data::{SeriesRecord, Tick};

/// Time-series store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeSeriesError {
    /// Store could not be reached.
    #[error("time-series store unavailable: {message}")]
    Unavailable {
        /// Error details.
        message: String,
    },

    /// Store rejected the query or write.
    #[error("time-series query failed: {message}")]
    Query {
        /// Error details.
        message: String,
    },
}

/// Port for the time-series store.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Append ticks for an asset. Returns the number of ticks written.
    ///
    /// Writing a tick at an existing timestamp replaces it.
    async fn write(
        &self,
        asset: &Asset,
        kind: QueryKind,
        ticks: &[Tick],
    ) -> Result<usize, TimeSeriesError>;

    /// Records for an asset strictly after `since`, or all when `None`.
    async fn query(
        &self,
        asset: &Asset,
        kind: QueryKind,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<SeriesRecord>, TimeSeriesError>;

    /// Newest stored timestamp for an asset.
    async fn latest_timestamp(
        &self,
        asset: &Asset,
        kind: QueryKind,
    ) -> Result<Option<DateTime<Utc>>, TimeSeriesError>;

    /// Drop every series of an asset.
    async fn delete_asset(&self, asset: &Asset) -> Result<(), TimeSeriesError>;
}
