//! Currency exchange rates against USD.
//!
//! The feed answers with one object per pair, keyed `USD<code>`:
//! `{"USDTWD":{"Exrate":32.1,"UTC":"2024-03-04 10:00:00"}}`.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Number;

use super::get_json;
use crate::application::ports::{CurrencyRate, CurrencyRateSource, SourceError};

const RATES_URL: &str = "https://tw.rter.info/capi.php";

#[derive(Debug, Deserialize)]
struct RateQuote {
    #[serde(rename = "Exrate")]
    exrate: Number,
    #[serde(rename = "UTC")]
    utc: String,
}

/// Currency code for a feed key; `None` for keys that are not USD pairs.
fn currency_code(key: &str) -> Option<&str> {
    match key {
        "USD" => Some("USD"),
        "USDUSD" => None,
        _ => key
            .strip_prefix("USD")
            .filter(|code| code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic())),
    }
}

fn to_rates(quotes: HashMap<String, RateQuote>) -> Result<Vec<CurrencyRate>, SourceError> {
    let mut rates = Vec::with_capacity(quotes.len());
    for (key, quote) in quotes {
        let Some(code) = currency_code(&key) else {
            continue;
        };
        let rate = Decimal::from_str(&quote.exrate.to_string()).map_err(|e| SourceError::Decode {
            message: format!("{key} rate {}: {e}", quote.exrate),
        })?;
        let time = NaiveDateTime::parse_from_str(&quote.utc, "%Y-%m-%d %H:%M:%S")
            .map_err(|e| SourceError::Decode {
                message: format!("{key} time {}: {e}", quote.utc),
            })?
            .and_utc();
        rates.push(CurrencyRate {
            code: code.to_string(),
            rate,
            time,
        });
    }
    rates.sort_by(|a, b| a.code.cmp(&b.code));
    Ok(rates)
}

/// Exchange-rate source.
#[derive(Debug, Clone)]
pub struct ExchangeRateSource {
    client: reqwest::Client,
}

impl ExchangeRateSource {
    /// Create a source on a shared client.
    #[must_use]
    pub const fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CurrencyRateSource for ExchangeRateSource {
    async fn latest_rates(&self) -> Result<Vec<CurrencyRate>, SourceError> {
        let quotes: HashMap<String, RateQuote> = get_json(&self.client, RATES_URL).await?;
        let rates = to_rates(quotes)?;
        tracing::debug!(count = rates.len(), at = %Utc::now(), "Fetched exchange rates");
        Ok(rates)
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("USDTWD", Some("TWD") ; "pair")]
    #[test_case("USD", Some("USD") ; "base")]
    #[test_case("USDUSD", None ; "self pair")]
    #[test_case("USD1INCH", None ; "token symbol")]
    #[test_case("EURJPY", None ; "cross pair")]
    fn maps_feed_keys(key: &str, expected: Option<&str>) {
        assert_eq!(currency_code(key), expected);
    }

    #[test]
    fn decodes_rates_exactly() {
        let body = r#"{
            "USDTWD":{"Exrate":31.585,"UTC":"2024-03-04 10:00:00"},
            "USDJPY":{"Exrate":150.12,"UTC":"2024-03-04 10:00:00"},
            "USDUSD":{"Exrate":1,"UTC":"2024-03-04 10:00:00"}
        }"#;
        let quotes: HashMap<String, RateQuote> = serde_json::from_str(body).unwrap();

        let rates = to_rates(quotes).unwrap();

        assert_eq!(rates.len(), 2);
        assert_eq!(rates[0].code, "JPY");
        assert_eq!(rates[1].code, "TWD");
        assert_eq!(rates[1].rate, Decimal::new(31_585, 3));
        assert_eq!(rates[1].time.to_rfc3339(), "2024-03-04T10:00:00+00:00");
    }
}
