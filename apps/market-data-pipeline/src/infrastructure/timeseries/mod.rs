//! In-memory time-series store.
//!
//! Series are keyed by `(asset, kind)` and hold one field map per
//! timestamp. Currencies store a single `rate` field; everything else stores
//! OHLCV.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::application::ports::{TimeSeriesError, TimeSeriesStore};
use crate::domain::asset::{Asset, AssetClass, AssetId, QueryKind};
use crate::domain::market_data::{SeriesRecord, Tick, field};

type Fields = BTreeMap<String, f64>;
type Series = BTreeMap<DateTime<Utc>, Fields>;

/// Process-local time-series store.
#[derive(Debug, Default)]
pub struct InMemoryTimeSeriesStore {
    series: RwLock<HashMap<(AssetId, QueryKind), Series>>,
}

impl InMemoryTimeSeriesStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one raw record, bypassing tick normalization.
    pub fn insert_raw(&self, asset: &Asset, kind: QueryKind, record: SeriesRecord) {
        self.series
            .write()
            .entry((asset.id(), kind))
            .or_default()
            .entry(record.time)
            .or_default()
            .insert(record.field, record.value);
    }

    /// Number of timestamps stored for an asset.
    #[must_use]
    pub fn len(&self, asset: &Asset, kind: QueryKind) -> usize {
        self.series
            .read()
            .get(&(asset.id(), kind))
            .map_or(0, BTreeMap::len)
    }

    /// Whether nothing is stored for an asset.
    #[must_use]
    pub fn is_empty(&self, asset: &Asset, kind: QueryKind) -> bool {
        self.len(asset, kind) == 0
    }
}

fn to_f64(field: &str, value: Decimal) -> Result<f64, TimeSeriesError> {
    value.to_f64().ok_or_else(|| TimeSeriesError::Query {
        message: format!("{field} value {value} is not representable"),
    })
}

fn tick_fields(class: AssetClass, tick: &Tick) -> Result<Fields, TimeSeriesError> {
    let mut fields = Fields::new();
    match class {
        AssetClass::Currency => {
            fields.insert(field::RATE.to_string(), to_f64(field::RATE, tick.close)?);
        }
        AssetClass::Crypto | AssetClass::StockTw => {
            for (name, value) in [
                (field::OPEN, tick.open),
                (field::HIGH, tick.high),
                (field::LOW, tick.low),
                (field::CLOSE, tick.close),
                (field::VOLUME, tick.volume),
            ] {
                fields.insert(name.to_string(), to_f64(name, value)?);
            }
        }
    }
    Ok(fields)
}

#[async_trait]
impl TimeSeriesStore for InMemoryTimeSeriesStore {
    async fn write(
        &self,
        asset: &Asset,
        kind: QueryKind,
        ticks: &[Tick],
    ) -> Result<usize, TimeSeriesError> {
        let rows = ticks
            .iter()
            .map(|tick| Ok((tick.time, tick_fields(asset.class(), tick)?)))
            .collect::<Result<Vec<_>, TimeSeriesError>>()?;

        let mut series = self.series.write();
        let entry = series.entry((asset.id(), kind)).or_default();
        let written = rows.len();
        entry.extend(rows);
        Ok(written)
    }

    async fn query(
        &self,
        asset: &Asset,
        kind: QueryKind,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<SeriesRecord>, TimeSeriesError> {
        let series = self.series.read();
        let Some(entry) = series.get(&(asset.id(), kind)) else {
            return Ok(Vec::new());
        };

        let lower = since.map_or(Bound::Unbounded, Bound::Excluded);
        Ok(entry
            .range((lower, Bound::Unbounded))
            .flat_map(|(time, fields)| {
                fields
                    .iter()
                    .map(|(name, value)| SeriesRecord::new(*time, name.clone(), *value))
            })
            .collect())
    }

    async fn latest_timestamp(
        &self,
        asset: &Asset,
        kind: QueryKind,
    ) -> Result<Option<DateTime<Utc>>, TimeSeriesError> {
        Ok(self
            .series
            .read()
            .get(&(asset.id(), kind))
            .and_then(|entry| entry.keys().next_back().copied()))
    }

    async fn delete_asset(&self, asset: &Asset) -> Result<(), TimeSeriesError> {
        let id = asset.id();
        self.series.write().retain(|(asset_id, _), _| *asset_id != id);
        Ok(())
    }
}
