//! HTTP Price Sources
//!
//! `reqwest` adapters for the polled and historical price sources:
//! the TWSE/TPEx quote and history endpoints, Binance REST klines and the
//! exchange-rate feed. Parsing is kept in plain functions over the decoded
//! JSON so it can be tested without a network.

mod binance;
mod rates;
mod twse;

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::de::DeserializeOwned;

pub use binance::BinanceHistorySource;
pub use rates::ExchangeRateSource;
pub use twse::{TwseHistorySource, TwseQuoteSource};

use crate::application::ports::SourceError;

/// Build the shared HTTP client.
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialized.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, SourceError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("market-data-pipeline/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| SourceError::Http {
            message: e.to_string(),
        })
}

async fn get_json<T: DeserializeOwned>(client: &reqwest::Client, url: &str) -> Result<T, SourceError> {
    tracing::debug!(url, "Fetching source data");
    let response = client
        .get(url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| SourceError::Http {
            message: e.to_string(),
        })?;
    response.json::<T>().await.map_err(|e| SourceError::Decode {
        message: e.to_string(),
    })
}

/// Parse a price string, accepting thousands separators.
fn parse_decimal(field: &str, raw: &str) -> Result<Decimal, SourceError> {
    Decimal::from_str(&raw.trim().replace(',', "")).map_err(|_| SourceError::Decode {
        message: format!("{field} is not a number: {raw}"),
    })
}
