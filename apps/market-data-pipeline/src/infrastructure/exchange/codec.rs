//! Exchange Feed Codec
//!
//! Encodes subscription commands and decodes inbound frames of the combined
//! kline stream.
//!
//! # Frames
//!
//! ```json
//! {"method":"SUBSCRIBE","params":["btcusdt@kline_1m"],"id":null}
//! {"stream":"btcusdt@kline_1m","data":{"e":"kline","k":{"t":1700000000000,"s":"BTCUSDT","o":"1.0",...}}}
//! {"result":null,"id":null}
//! ```

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::market_data::Tick;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// A price or volume field was not a decimal number.
    #[error("invalid number in field {field}: {value}")]
    InvalidNumber {
        /// Field name.
        field: &'static str,
        /// Raw value.
        value: String,
    },

    /// Open time was out of range.
    #[error("invalid open time: {0}")]
    InvalidTime(i64),
}

// =============================================================================
// Outbound
// =============================================================================

/// Command verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FeedMethod {
    /// Add streams.
    Subscribe,
    /// Remove streams.
    Unsubscribe,
}

/// Outbound command frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedCommand {
    /// Verb.
    pub method: FeedMethod,
    /// Stream names, e.g. `btcusdt@kline_1m`.
    pub params: Vec<String>,
    /// Request id, always null.
    pub id: Option<u64>,
}

impl FeedCommand {
    /// Subscribe command. Streams are sorted for stable frames.
    #[must_use]
    pub fn subscribe(streams: impl IntoIterator<Item = String>) -> Self {
        Self::new(FeedMethod::Subscribe, streams)
    }

    /// Unsubscribe command.
    #[must_use]
    pub fn unsubscribe(streams: impl IntoIterator<Item = String>) -> Self {
        Self::new(FeedMethod::Unsubscribe, streams)
    }

    fn new(method: FeedMethod, streams: impl IntoIterator<Item = String>) -> Self {
        let mut params: Vec<String> = streams.into_iter().collect();
        params.sort();
        params.dedup();
        Self {
            method,
            params,
            id: None,
        }
    }

    /// Whether the command carries no streams.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

// =============================================================================
// Inbound
// =============================================================================

/// Decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Kline update.
    Tick(Tick),
    /// Command acknowledgment.
    Ack {
        /// Echoed request id.
        id: Option<u64>,
    },
    /// Anything else.
    Unrecognized,
}

#[derive(Debug, Deserialize)]
struct KlineFields {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
}

fn decimal(field: &'static str, value: &str) -> Result<Decimal, CodecError> {
    Decimal::from_str(value).map_err(|_| CodecError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

impl TryFrom<KlineFields> for Tick {
    type Error = CodecError;

    fn try_from(k: KlineFields) -> Result<Self, Self::Error> {
        let time = DateTime::<Utc>::from_timestamp_millis(k.open_time)
            .ok_or(CodecError::InvalidTime(k.open_time))?;
        Ok(Self {
            symbol: k.symbol,
            time,
            open: decimal("o", &k.open)?,
            high: decimal("h", &k.high)?,
            low: decimal("l", &k.low)?,
            close: decimal("c", &k.close)?,
            volume: decimal("v", &k.volume)?,
        })
    }
}

/// JSON codec for the exchange feed.
#[derive(Debug, Default, Clone, Copy)]
pub struct FeedCodec;

impl FeedCodec {
    /// Create a codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode one text frame.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid JSON or a kline with malformed fields.
    pub fn decode(&self, text: &str) -> Result<InboundFrame, CodecError> {
        let value: serde_json::Value = serde_json::from_str(text)?;

        if let Some(kline) = value.get("data").and_then(|data| data.get("k")) {
            let fields = KlineFields::deserialize(kline)?;
            return Ok(InboundFrame::Tick(Tick::try_from(fields)?));
        }

        if value.get("result").is_some() {
            let id = value.get("id").and_then(serde_json::Value::as_u64);
            return Ok(InboundFrame::Ack { id });
        }

        Ok(InboundFrame::Unrecognized)
    }

    /// Encode a command frame.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode(&self, command: &FeedCommand) -> Result<String, CodecError> {
        Ok(serde_json::to_string(command)?)
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    const KLINE: &str = r#"{"stream":"btcusdt@kline_1m","data":{"e":"kline","E":1700000001000,"s":"BTCUSDT","k":{"t":1700000000000,"T":1700000059999,"s":"BTCUSDT","i":"1m","o":"37000.10","c":"37010.00","h":"37020.50","l":"36990.00","v":"12.5","x":false}}}"#;

    #[test]
    fn decodes_kline_into_tick() {
        let frame = FeedCodec::new().decode(KLINE).unwrap();

        let InboundFrame::Tick(tick) = frame else {
            panic!("expected tick, got {frame:?}");
        };
        assert_eq!(tick.symbol, "BTCUSDT");
        assert_eq!(tick.time.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(tick.open, Decimal::new(3_700_010, 2));
        assert_eq!(tick.high, Decimal::new(3_702_050, 2));
        assert_eq!(tick.volume, Decimal::new(125, 1));
    }

    #[test_case(r#"{"result":null,"id":null}"#, InboundFrame::Ack { id: None } ; "ack without id")]
    #[test_case(r#"{"result":null,"id":7}"#, InboundFrame::Ack { id: Some(7) } ; "ack with id")]
    #[test_case(r#"{"ping":1}"#, InboundFrame::Unrecognized ; "unknown object")]
    #[test_case(r#"{"data":{"e":"trade"}}"#, InboundFrame::Unrecognized ; "non kline data")]
    fn classifies_control_frames(text: &str, expected: InboundFrame) {
        assert_eq!(FeedCodec::new().decode(text).unwrap(), expected);
    }

    #[test_case("not json" ; "garbage")]
    #[test_case(r#"{"data":{"k":{"t":1,"s":"X","o":"abc","h":"1","l":"1","c":"1","v":"1"}}}"#; "bad decimal")]
    #[test_case(r#"{"data":{"k":{"t":1,"s":"X"}}}"# ; "missing fields")]
    fn rejects_malformed_frames(text: &str) {
        assert!(FeedCodec::new().decode(text).is_err());
    }

    #[test]
    fn encodes_sorted_subscribe_frame() {
        let command = FeedCommand::subscribe(vec![
            "ethusdt@kline_1m".to_string(),
            "btcusdt@kline_1m".to_string(),
        ]);

        let json = FeedCodec::new().encode(&command).unwrap();

        assert_eq!(
            json,
            r#"{"method":"SUBSCRIBE","params":["btcusdt@kline_1m","ethusdt@kline_1m"],"id":null}"#
        );
    }

    #[test]
    fn encodes_unsubscribe_frame() {
        let command = FeedCommand::unsubscribe(vec!["btcusdt@kline_1m".to_string()]);
        let json = FeedCodec::new().encode(&command).unwrap();
        assert!(json.starts_with(r#"{"method":"UNSUBSCRIBE""#));
    }
}
