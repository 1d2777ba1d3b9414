//! Asset Identity
//!
//! Every integration point (feed normalization, cache-key formatting,
//! backfill query construction) dispatches on [`Asset`] with an exhaustive
//! match, so adding an asset class is a compile error until every site
//! handles it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// =============================================================================
// Types
// =============================================================================

/// Stable identifier of an asset row.
pub type AssetId = u64;

/// Identifier of an application user.
pub type UserId = u64;

/// Channel used for crypto kline streams.
pub const DEFAULT_CHANNEL: &str = "kline_1m";

/// Listing venue of a local equity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TwMarket {
    /// Main board.
    Twse,
    /// Over-the-counter board.
    Otc,
}

impl TwMarket {
    /// Prefix used by the quote inquiry API.
    #[must_use]
    pub const fn inquiry_prefix(self) -> &'static str {
        match self {
            Self::Twse => "tse",
            Self::Otc => "otc",
        }
    }
}

/// Coarse asset class, used for per-class policies and job routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    /// Crypto trading pair, streamed from the exchange feed.
    Crypto,
    /// Local equity, polled during market hours.
    StockTw,
    /// Currency exchange rate, refreshed on a schedule.
    Currency,
}

impl AssetClass {
    /// Get the class name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Crypto => "crypto",
            Self::StockTw => "stock_tw",
            Self::Currency => "currency",
        }
    }
}

/// A tracked asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Asset {
    /// Crypto trading pair such as `BTCUSDT`.
    Crypto {
        /// Asset row id.
        id: AssetId,
        /// Exchange trading pair symbol.
        trading_pair: String,
    },
    /// Local equity such as `2330`.
    StockTw {
        /// Asset row id.
        id: AssetId,
        /// Exchange stock code.
        stock_code: String,
        /// Listing venue.
        market: TwMarket,
    },
    /// Currency quoted against the base currency.
    Currency {
        /// Asset row id.
        id: AssetId,
        /// ISO currency code.
        code: String,
    },
}

impl Asset {
    /// Create a crypto asset.
    #[must_use]
    pub fn crypto(id: AssetId, trading_pair: impl Into<String>) -> Self {
        Self::Crypto {
            id,
            trading_pair: trading_pair.into().to_uppercase(),
        }
    }

    /// Create a local equity asset.
    #[must_use]
    pub fn stock_tw(id: AssetId, stock_code: impl Into<String>, market: TwMarket) -> Self {
        Self::StockTw {
            id,
            stock_code: stock_code.into(),
            market,
        }
    }

    /// Create a currency asset.
    #[must_use]
    pub fn currency(id: AssetId, code: impl Into<String>) -> Self {
        Self::Currency {
            id,
            code: code.into().to_uppercase(),
        }
    }

    /// Get the asset row id.
    #[must_use]
    pub const fn id(&self) -> AssetId {
        match self {
            Self::Crypto { id, .. } | Self::StockTw { id, .. } | Self::Currency { id, .. } => *id,
        }
    }

    /// Get the asset class.
    #[must_use]
    pub const fn class(&self) -> AssetClass {
        match self {
            Self::Crypto { .. } => AssetClass::Crypto,
            Self::StockTw { .. } => AssetClass::StockTw,
            Self::Currency { .. } => AssetClass::Currency,
        }
    }

    /// Get the human-facing symbol.
    #[must_use]
    pub fn symbol(&self) -> &str {
        match self {
            Self::Crypto { trading_pair, .. } => trading_pair,
            Self::StockTw { stock_code, .. } => stock_code,
            Self::Currency { code, .. } => code,
        }
    }

    /// Stream name on the exchange feed, e.g. `btcusdt@kline_1m`.
    ///
    /// Only crypto assets are streamed.
    #[must_use]
    pub fn feed_stream(&self, channel: &str) -> Option<String> {
        match self {
            Self::Crypto { trading_pair, .. } => Some(format!(
                "{}@{}",
                trading_pair.to_lowercase(),
                channel.to_lowercase()
            )),
            Self::StockTw { .. } | Self::Currency { .. } => None,
        }
    }

    /// Quote inquiry token, e.g. `tse_2330.tw`.
    ///
    /// Only local equities are polled.
    #[must_use]
    pub fn inquiry(&self) -> Option<String> {
        match self {
            Self::StockTw {
                stock_code, market, ..
            } => Some(format!("{}_{stock_code}.tw", market.inquiry_prefix())),
            Self::Crypto { .. } | Self::Currency { .. } => None,
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class().as_str(), self.symbol())
    }
}

// =============================================================================
// Query Kind
// =============================================================================

/// Which slice of the time series a client asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    /// Intraday ticks from the live feed or poller.
    Current,
    /// Daily bars from backfill.
    History,
}

impl QueryKind {
    /// Get the name used in cache keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::History => "history",
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a [`QueryKind`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown query kind: {0}")]
pub struct UnknownQueryKind(pub String);

impl FromStr for QueryKind {
    type Err = UnknownQueryKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "current" => Ok(Self::Current),
            "history" | "historical" => Ok(Self::History),
            _ => Err(UnknownQueryKind(s.to_string())),
        }
    }
}
