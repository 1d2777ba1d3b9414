//! Remote Price Source Ports (Driven Ports)
//!
//! Sources for assets that have no push feed (local equities), for daily
//! history, and for currency exchange rates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::asset::{Asset, AssetClass};
use crate::domain::market_data::Tick;

/// Remote source error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// Transport failure or non-success HTTP status.
    #[error("source request failed: {message}")]
    Http {
        /// Error details.
        message: String,
    },

    /// Response body could not be decoded.
    #[error("source response malformed: {message}")]
    Decode {
        /// Error details.
        message: String,
    },

    /// The source does not serve this asset class.
    #[error("source does not serve {class:?} assets")]
    Unsupported {
        /// Requested class.
        class: AssetClass,
    },
}

/// Exchange rate of one currency against the base currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyRate {
    /// Quoted currency code, e.g. `TWD`.
    pub code: String,
    /// Units of the quoted currency per base unit.
    pub rate: Decimal,
    /// Quote time.
    pub time: DateTime<Utc>,
}

/// Port for polled local-equity quotes.
#[async_trait]
pub trait EquitiesQuoteSource: Send + Sync {
    /// Latest quotes for the given stocks. Stocks without a trade yet are
    /// omitted.
    async fn fetch_quotes(&self, stocks: &[Asset]) -> Result<Vec<Tick>, SourceError>;

    /// Whether the source still lists the stock.
    async fn is_listed(&self, stock: &Asset) -> Result<bool, SourceError>;
}

/// Port for daily history bars.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Daily bars for an asset strictly after `since`.
    async fn daily_bars(
        &self,
        asset: &Asset,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Tick>, SourceError>;
}

/// Port for currency exchange rates.
#[async_trait]
pub trait CurrencyRateSource: Send + Sync {
    /// Latest rates against the base currency.
    async fn latest_rates(&self) -> Result<Vec<CurrencyRate>, SourceError>;
}
