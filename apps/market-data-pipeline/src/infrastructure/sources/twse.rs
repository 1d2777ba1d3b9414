//! Taiwan equities: real-time quotes from the TWSE MIS endpoint and daily
//! history from the TWSE and TPEx after-trading reports.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Months, NaiveDate, TimeZone, Utc};
use chrono_tz::Asia::Taipei;
use rust_decimal::Decimal;
use serde::Deserialize;

use super::{get_json, parse_decimal};
use crate::application::ports::{EquitiesQuoteSource, HistorySource, SourceError};
use crate::domain::asset::{Asset, TwMarket};
use crate::domain::market_data::Tick;

const QUOTE_URL: &str = "https://mis.twse.com.tw/stock/api/getStockInfo.jsp?ex_ch=";
const TWSE_DAY_URL: &str = "https://www.twse.com.tw/rwd/zh/afterTrading/STOCK_DAY";
const TPEX_DAY_URL: &str = "https://www.tpex.org.tw/www/zh-tw/afterTrading/tradingStock";

/// Placeholders the MIS endpoint uses before the first trade.
const NO_TRADE: [&str; 2] = ["-", "--"];

// =============================================================================
// Quotes
// =============================================================================

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    #[serde(rename = "msgArray", default)]
    msg_array: Vec<QuoteMessage>,
}

#[derive(Debug, Deserialize)]
struct QuoteMessage {
    c: String,
    #[serde(default)]
    z: String,
    #[serde(default)]
    o: String,
    #[serde(default)]
    h: String,
    #[serde(default)]
    l: String,
    #[serde(default)]
    v: String,
    #[serde(default)]
    tlong: String,
}

fn quote_to_tick(msg: &QuoteMessage) -> Result<Option<Tick>, SourceError> {
    if [&msg.z, &msg.o, &msg.h, &msg.l]
        .iter()
        .any(|value| value.is_empty() || NO_TRADE.contains(&value.as_str()))
    {
        return Ok(None);
    }

    let millis: i64 = msg.tlong.parse().map_err(|_| SourceError::Decode {
        message: format!("tlong is not epoch millis: {}", msg.tlong),
    })?;
    let time = DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| SourceError::Decode {
        message: format!("tlong out of range: {millis}"),
    })?;
    let volume = if NO_TRADE.contains(&msg.v.as_str()) || msg.v.is_empty() {
        Decimal::ZERO
    } else {
        parse_decimal("v", &msg.v)?
    };

    Ok(Some(Tick {
        symbol: msg.c.clone(),
        time,
        open: parse_decimal("o", &msg.o)?,
        high: parse_decimal("h", &msg.h)?,
        low: parse_decimal("l", &msg.l)?,
        close: parse_decimal("z", &msg.z)?,
        volume,
    }))
}

fn quote_url(stocks: &[Asset]) -> String {
    let inquiry: Vec<String> = stocks.iter().filter_map(Asset::inquiry).collect();
    format!("{QUOTE_URL}{}", inquiry.join("|"))
}

/// Real-time quote source for listed and OTC stocks.
#[derive(Debug, Clone)]
pub struct TwseQuoteSource {
    client: reqwest::Client,
}

impl TwseQuoteSource {
    /// Create a source on a shared client.
    #[must_use]
    pub const fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EquitiesQuoteSource for TwseQuoteSource {
    async fn fetch_quotes(&self, stocks: &[Asset]) -> Result<Vec<Tick>, SourceError> {
        if stocks.is_empty() {
            return Ok(Vec::new());
        }
        let response: QuoteResponse = get_json(&self.client, &quote_url(stocks)).await?;
        let mut ticks = Vec::with_capacity(response.msg_array.len());
        for msg in &response.msg_array {
            match quote_to_tick(msg)? {
                Some(tick) => ticks.push(tick),
                None => tracing::debug!(code = %msg.c, "No trade yet, skipping quote"),
            }
        }
        Ok(ticks)
    }

    async fn is_listed(&self, stock: &Asset) -> Result<bool, SourceError> {
        if stock.inquiry().is_none() {
            return Err(SourceError::Unsupported {
                class: stock.class(),
            });
        }
        let response: QuoteResponse =
            get_json(&self.client, &quote_url(std::slice::from_ref(stock))).await?;
        Ok(!response.msg_array.is_empty())
    }
}

// =============================================================================
// Daily history
// =============================================================================

#[derive(Debug, Deserialize)]
struct TwseDayResponse {
    #[serde(default)]
    data: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TpexDayResponse {
    #[serde(default)]
    tables: Vec<TpexTable>,
}

#[derive(Debug, Deserialize)]
struct TpexTable {
    #[serde(default)]
    data: Vec<Vec<String>>,
}

/// `113/03/01` (Republic of China calendar) to midnight Taipei time.
fn parse_roc_date(raw: &str) -> Result<DateTime<Utc>, SourceError> {
    let invalid = || SourceError::Decode {
        message: format!("invalid ROC date: {raw}"),
    };
    let mut parts = raw.trim().split('/');
    let (Some(year), Some(month), Some(day), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid());
    };
    let year: i32 = year.parse().map_err(|_| invalid())?;
    let month: u32 = month.parse().map_err(|_| invalid())?;
    let day: u32 = day.parse().map_err(|_| invalid())?;

    let date = NaiveDate::from_ymd_opt(year + 1911, month, day).ok_or_else(invalid)?;
    Taipei
        .from_local_datetime(&date.and_time(chrono::NaiveTime::MIN))
        .single()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(invalid)
}

/// Rows are `[date, volume, turnover, open, high, low, close, ...]`.
fn day_rows_to_ticks(code: &str, rows: &[Vec<String>]) -> Result<Vec<Tick>, SourceError> {
    let mut ticks = Vec::with_capacity(rows.len());
    for row in rows {
        if row.len() < 7 {
            return Err(SourceError::Decode {
                message: format!("short daily row for {code}: {} columns", row.len()),
            });
        }
        if row[3..=6].iter().any(|v| NO_TRADE.contains(&v.as_str())) {
            continue;
        }
        ticks.push(Tick {
            symbol: code.to_string(),
            time: parse_roc_date(&row[0])?,
            open: parse_decimal("open", &row[3])?,
            high: parse_decimal("high", &row[4])?,
            low: parse_decimal("low", &row[5])?,
            close: parse_decimal("close", &row[6])?,
            volume: parse_decimal("volume", &row[1])?,
        });
    }
    Ok(ticks)
}

/// First days of every month from `from` through `to`.
fn months_between(from: NaiveDate, to: NaiveDate) -> Vec<NaiveDate> {
    let mut months = Vec::new();
    let mut cursor = from.with_day(1).unwrap_or(from);
    while cursor <= to {
        months.push(cursor);
        match cursor.checked_add_months(Months::new(1)) {
            Some(next) => cursor = next,
            None => break,
        }
    }
    months
}

/// Daily history for listed and OTC stocks, one request per month.
#[derive(Debug, Clone)]
pub struct TwseHistorySource {
    client: reqwest::Client,
}

impl TwseHistorySource {
    /// Create a source on a shared client.
    #[must_use]
    pub const fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn month(
        &self,
        code: &str,
        market: TwMarket,
        month: NaiveDate,
    ) -> Result<Vec<Tick>, SourceError> {
        match market {
            TwMarket::Twse => {
                let url = format!(
                    "{TWSE_DAY_URL}?date={}&stockNo={code}&response=json",
                    month.format("%Y%m01")
                );
                let response: TwseDayResponse = get_json(&self.client, &url).await?;
                day_rows_to_ticks(code, &response.data)
            }
            TwMarket::Otc => {
                let url = format!(
                    "{TPEX_DAY_URL}?code={code}&date={}&response=json",
                    month.format("%Y/%m/01")
                );
                let response: TpexDayResponse = get_json(&self.client, &url).await?;
                let rows = response.tables.first().map_or(&[][..], |t| t.data.as_slice());
                day_rows_to_ticks(code, rows)
            }
        }
    }
}

#[async_trait]
impl HistorySource for TwseHistorySource {
    async fn daily_bars(
        &self,
        asset: &Asset,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Tick>, SourceError> {
        let Asset::StockTw {
            stock_code, market, ..
        } = asset
        else {
            return Err(SourceError::Unsupported {
                class: asset.class(),
            });
        };

        let today = Utc::now().with_timezone(&Taipei).date_naive();
        let from = since.map_or(today, |s| s.with_timezone(&Taipei).date_naive());

        let mut bars = Vec::new();
        for month in months_between(from, today) {
            let ticks = self.month(stock_code, *market, month).await?;
            bars.extend(ticks.into_iter().filter(|t| since.is_none_or(|s| t.time > s)));
        }
        tracing::debug!(code = %stock_code, bars = bars.len(), "Fetched daily history");
        Ok(bars)
    }
}
