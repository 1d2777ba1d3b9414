//! Market Data Types
//!
//! [`Tick`] is the normalized OHLCV record written to the time-series
//! store. [`SeriesRecord`] is the `(timestamp, field, value)` triple the
//! store hands back on the read path.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One OHLCV price record at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    /// Source symbol (trading pair, stock code or currency code).
    pub symbol: String,
    /// Bar open time.
    pub time: DateTime<Utc>,
    /// Open price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Close price.
    pub close: Decimal,
    /// Traded volume.
    pub volume: Decimal,
}

impl Tick {
    /// Create a rate-only record (currencies), where every price is the rate.
    #[must_use]
    pub fn rate(symbol: impl Into<String>, time: DateTime<Utc>, rate: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            time,
            open: rate,
            high: rate,
            low: rate,
            close: rate,
            volume: Decimal::ZERO,
        }
    }
}

/// Field names stored in the time series.
pub mod field {
    /// Open price.
    pub const OPEN: &str = "open";
    /// High price.
    pub const HIGH: &str = "high";
    /// Low price.
    pub const LOW: &str = "low";
    /// Close price.
    pub const CLOSE: &str = "close";
    /// Volume.
    pub const VOLUME: &str = "volume";
    /// Exchange rate (currencies only).
    pub const RATE: &str = "rate";
}

/// A single `(timestamp, field, value)` record from the time-series store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesRecord {
    /// Record timestamp.
    pub time: DateTime<Utc>,
    /// Field name, see [`field`].
    pub field: String,
    /// Field value.
    pub value: f64,
}

impl SeriesRecord {
    /// Create a new record.
    #[must_use]
    pub fn new(time: DateTime<Utc>, field: impl Into<String>, value: f64) -> Self {
        Self {
            time,
            field: field.into(),
            value,
        }
    }
}
