//! Daily crypto history from the Binance REST klines endpoint.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{get_json, parse_decimal};
use crate::application::ports::{HistorySource, SourceError};
use crate::domain::asset::Asset;
use crate::domain::market_data::Tick;

const KLINES_URL: &str = "https://api.binance.com/api/v3/klines";
const PAGE_LIMIT: usize = 1000;

/// A kline row is `[openTime, open, high, low, close, volume, closeTime, ...]`
/// with prices as strings.
fn row_to_tick(symbol: &str, row: &[Value]) -> Result<Tick, SourceError> {
    let decode = |message: String| SourceError::Decode { message };
    if row.len() < 6 {
        return Err(decode(format!("short kline row: {} columns", row.len())));
    }
    let open_time = row[0]
        .as_i64()
        .ok_or_else(|| decode(format!("open time is not an integer: {}", row[0])))?;
    let time = DateTime::<Utc>::from_timestamp_millis(open_time)
        .ok_or_else(|| decode(format!("open time out of range: {open_time}")))?;
    let text = |index: usize, name: &str| {
        row[index]
            .as_str()
            .ok_or_else(|| decode(format!("{name} is not a string: {}", row[index])))
    };

    Ok(Tick {
        symbol: symbol.to_string(),
        time,
        open: parse_decimal("open", text(1, "open")?)?,
        high: parse_decimal("high", text(2, "high")?)?,
        low: parse_decimal("low", text(3, "low")?)?,
        close: parse_decimal("close", text(4, "close")?)?,
        volume: parse_decimal("volume", text(5, "volume")?)?,
    })
}

/// Daily klines for crypto pairs.
#[derive(Debug, Clone)]
pub struct BinanceHistorySource {
    client: reqwest::Client,
}

impl BinanceHistorySource {
    /// Create a source on a shared client.
    #[must_use]
    pub const fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HistorySource for BinanceHistorySource {
    async fn daily_bars(
        &self,
        asset: &Asset,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Tick>, SourceError> {
        let Asset::Crypto { trading_pair, .. } = asset else {
            return Err(SourceError::Unsupported {
                class: asset.class(),
            });
        };

        let mut start = since.map_or(0, |s| s.timestamp_millis() + 1);
        let mut bars = Vec::new();
        loop {
            let url = format!(
                "{KLINES_URL}?symbol={trading_pair}&interval=1d&startTime={start}&limit={PAGE_LIMIT}"
            );
            let rows: Vec<Vec<Value>> = get_json(&self.client, &url).await?;
            let page_len = rows.len();
            for row in &rows {
                bars.push(row_to_tick(trading_pair, row)?);
            }
            match bars.last() {
                Some(last) if page_len == PAGE_LIMIT => start = last.time.timestamp_millis() + 1,
                _ => break,
            }
        }
        tracing::debug!(pair = %trading_pair, bars = bars.len(), "Fetched daily klines");
        Ok(bars)
    }
}
