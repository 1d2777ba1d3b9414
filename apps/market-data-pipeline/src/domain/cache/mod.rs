//! Cache Entry Types
//!
//! A cache entry is keyed by `kline_{kind}_{assetId}` and carries an
//! explicit status next to its data. Normalization turns raw
//! `(timestamp, field, value)` records into client-ready [`KlinePoint`]s.
//!
//! # Key layout
//!
//! ```text
//! kline_history_42          hash: status, last_timestamp, type
//! kline_history_42:data     list: one JSON array of KlinePoint per batch
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::asset::{Asset, AssetId, QueryKind};
use crate::domain::market_data::{SeriesRecord, field};

/// Timestamp layout used for cached records and the `last_timestamp` field.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Hash field holding the entry status.
pub const STATUS_FIELD: &str = "status";

/// Hash field holding the newest cached timestamp.
pub const LAST_TIMESTAMP_FIELD: &str = "last_timestamp";

/// Hash field holding the query kind.
pub const TYPE_FIELD: &str = "type";

// =============================================================================
// Status
// =============================================================================

/// Materialization status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    /// No entry yet, or the entry expired.
    Absent,
    /// A materialization is in flight.
    Processing,
    /// Data is cached.
    Success,
    /// The last attempt failed.
    Error,
    /// The store holds no records for the asset.
    NoData,
}

impl CacheStatus {
    /// Get the stored representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Error => "error",
            Self::NoData => "no_data",
        }
    }

    /// Whether the status is final for one materialization attempt.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::NoData)
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheStatus {
    type Err = NormalizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "absent" => Ok(Self::Absent),
            "processing" => Ok(Self::Processing),
            "success" => Ok(Self::Success),
            // older entries were written as "fail"
            "error" | "fail" => Ok(Self::Error),
            "no_data" => Ok(Self::NoData),
            other => Err(NormalizeError::UnknownStatus(other.to_string())),
        }
    }
}

// =============================================================================
// Key
// =============================================================================

/// Cache key for one `(kind, asset)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Query kind.
    pub kind: QueryKind,
    /// Asset row id.
    pub asset_id: AssetId,
}

impl CacheKey {
    /// Build the key for an asset.
    #[must_use]
    pub const fn for_asset(asset: &Asset, kind: QueryKind) -> Self {
        let asset_id = match asset {
            Asset::Crypto { id, .. } | Asset::StockTw { id, .. } | Asset::Currency { id, .. } => {
                *id
            }
        };
        Self { kind, asset_id }
    }

    /// Hash key, e.g. `kline_current_42`.
    #[must_use]
    pub fn hash_key(&self) -> String {
        format!("kline_{}_{}", self.kind.as_str(), self.asset_id)
    }

    /// Companion list key, e.g. `kline_current_42:data`.
    #[must_use]
    pub fn data_key(&self) -> String {
        format!("{}:data", self.hash_key())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hash_key())
    }
}

// =============================================================================
// Records
// =============================================================================

/// Client-ready OHLCV point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KlinePoint {
    /// Timestamp in [`TIMESTAMP_FORMAT`].
    pub timestamp: String,
    /// Open price.
    pub open: Option<String>,
    /// High price.
    pub high: Option<String>,
    /// Low price.
    pub low: Option<String>,
    /// Close price.
    pub close: Option<String>,
    /// Volume.
    pub volume: Option<String>,
}

/// Snapshot of one cache entry as a reader sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    /// Current status.
    pub status: CacheStatus,
    /// Cached points, oldest batch first.
    pub records: Vec<KlinePoint>,
    /// Newest cached timestamp.
    pub last_timestamp: Option<String>,
}

impl CacheEntry {
    /// An entry that does not exist.
    #[must_use]
    pub const fn absent() -> Self {
        Self {
            status: CacheStatus::Absent,
            records: Vec::new(),
            last_timestamp: None,
        }
    }
}

/// Normalized batch ready to append to a cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedBatch {
    /// Points ordered by timestamp.
    pub points: Vec<KlinePoint>,
    /// Newest timestamp in the batch.
    pub last_timestamp: DateTime<Utc>,
}

impl NormalizedBatch {
    /// `last_timestamp` rendered in [`TIMESTAMP_FORMAT`].
    #[must_use]
    pub fn last_timestamp_string(&self) -> String {
        format_timestamp(self.last_timestamp)
    }
}

/// Errors turning raw records into cache points.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    /// Record carried a field this pipeline does not know.
    #[error("unknown record field: {0}")]
    UnknownField(String),

    /// Stored status string was not recognized.
    #[error("unknown cache status: {0}")]
    UnknownStatus(String),
}

/// Render a timestamp in [`TIMESTAMP_FORMAT`].
#[must_use]
pub fn format_timestamp(time: DateTime<Utc>) -> String {
    time.format(TIMESTAMP_FORMAT).to_string()
}

fn format_value(value: f64) -> String {
    format!("{value:.6}")
}

/// Fold raw records into one point per timestamp.
///
/// Rate records (currencies) fill all four prices and set volume to `"0"`.
/// Returns `Ok(None)` for an empty input.
///
/// # Errors
///
/// Returns [`NormalizeError::UnknownField`] for any field outside
/// open/high/low/close/volume/rate. No partial batch is produced.
pub fn normalize_records(
    records: &[SeriesRecord],
) -> Result<Option<NormalizedBatch>, NormalizeError> {
    let mut points: BTreeMap<DateTime<Utc>, KlinePoint> = BTreeMap::new();

    for record in records {
        let formatted = format_value(record.value);
        let point = points.entry(record.time).or_insert_with(|| KlinePoint {
            timestamp: format_timestamp(record.time),
            ..KlinePoint::default()
        });

        match record.field.as_str() {
            field::OPEN => point.open = Some(formatted),
            field::HIGH => point.high = Some(formatted),
            field::LOW => point.low = Some(formatted),
            field::CLOSE => point.close = Some(formatted),
            field::VOLUME => point.volume = Some(formatted),
            field::RATE => {
                point.open = Some(formatted.clone());
                point.high = Some(formatted.clone());
                point.low = Some(formatted.clone());
                point.close = Some(formatted);
                point.volume = Some("0".to_string());
            }
            other => return Err(NormalizeError::UnknownField(other.to_string())),
        }
    }

    let Some(last_timestamp) = points.keys().next_back().copied() else {
        return Ok(None);
    };

    Ok(Some(NormalizedBatch {
        points: points.into_values().collect(),
        last_timestamp,
    }))
}
