//! Cache Materialization Integration Tests
//!
//! Writes ticks through the public store API, materializes them into the
//! in-memory cache and reads the entries back the way a client would.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use tokio::time::timeout;

use market_data_pipeline::application::ports::{CacheStore, TimeSeriesStore};
use market_data_pipeline::infrastructure::cache::InMemoryCacheStore;
use market_data_pipeline::infrastructure::timeseries::InMemoryTimeSeriesStore;
use market_data_pipeline::{
    Asset, CacheKey, CacheMaterializer, CacheStatus, MaterializeOutcome, QueryKind, Tick,
    WorkerPool,
};

const WAIT: Duration = Duration::from_secs(5);

struct Fixture {
    store: Arc<InMemoryTimeSeriesStore>,
    cache: Arc<InMemoryCacheStore>,
    materializer: CacheMaterializer,
}

fn fixture() -> Fixture {
    let store = Arc::new(InMemoryTimeSeriesStore::new());
    let cache = Arc::new(InMemoryCacheStore::new());
    let materializer = CacheMaterializer::new(
        Arc::clone(&store) as Arc<dyn TimeSeriesStore>,
        Arc::clone(&cache) as Arc<dyn CacheStore>,
        WorkerPool::new(4),
        Duration::from_secs(3600),
    );
    Fixture {
        store,
        cache,
        materializer,
    }
}

fn minute(n: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 1, 0, 0).unwrap() + chrono::Duration::minutes(n)
}

fn bar(n: i64, close: i64) -> Tick {
    Tick {
        symbol: "BTCUSDT".to_string(),
        time: minute(n),
        open: Decimal::from(close - 1),
        high: Decimal::from(close + 1),
        low: Decimal::from(close - 2),
        close: Decimal::from(close),
        volume: Decimal::new(15, 1),
    }
}

async fn materialize(f: &Fixture, asset: &Asset, kind: QueryKind) -> CacheStatus {
    match f.materializer.request(asset, kind, None).await.unwrap() {
        MaterializeOutcome::Started(handle) => timeout(WAIT, handle.wait()).await.unwrap(),
        MaterializeOutcome::AlreadyProcessing => panic!("unexpected concurrent materialization"),
    }
}

#[tokio::test]
async fn materializes_then_resumes_after_last_cached_point() {
    let f = fixture();
    let btc = Asset::crypto(1, "BTCUSDT");
    f.store
        .write(&btc, QueryKind::History, &[bar(0, 100), bar(1, 101)])
        .await
        .unwrap();

    assert_eq!(materialize(&f, &btc, QueryKind::History).await, CacheStatus::Success);

    let entry = f.materializer.read(&btc, QueryKind::History).await.unwrap();
    assert_eq!(entry.status, CacheStatus::Success);
    assert_eq!(entry.records.len(), 2);
    assert_eq!(entry.records[1].close.as_deref(), Some("101.000000"));
    assert_eq!(entry.last_timestamp.as_deref(), Some("2024-03-04T01:01:00.000Z"));

    // only the new point is appended on the next run
    f.store
        .write(&btc, QueryKind::History, &[bar(2, 105)])
        .await
        .unwrap();
    assert_eq!(materialize(&f, &btc, QueryKind::History).await, CacheStatus::Success);

    let key = CacheKey::for_asset(&btc, QueryKind::History);
    assert_eq!(f.cache.batch_count(&key).await.unwrap(), 2);
    let entry = f.materializer.read(&btc, QueryKind::History).await.unwrap();
    assert_eq!(entry.records.len(), 3);
    assert_eq!(entry.last_timestamp.as_deref(), Some("2024-03-04T01:02:00.000Z"));

    // nothing new: still success, data unchanged
    assert_eq!(materialize(&f, &btc, QueryKind::History).await, CacheStatus::Success);
    assert_eq!(f.cache.batch_count(&key).await.unwrap(), 2);
}

#[tokio::test]
async fn empty_series_is_no_data() {
    let f = fixture();
    let eth = Asset::crypto(2, "ETHUSDT");

    assert_eq!(materialize(&f, &eth, QueryKind::Current).await, CacheStatus::NoData);

    let entry = f.materializer.read(&eth, QueryKind::Current).await.unwrap();
    assert_eq!(entry.status, CacheStatus::NoData);
    assert!(entry.records.is_empty());
}

#[tokio::test]
async fn kinds_are_cached_separately() {
    let f = fixture();
    let btc = Asset::crypto(1, "BTCUSDT");
    f.store
        .write(&btc, QueryKind::Current, &[bar(5, 200)])
        .await
        .unwrap();

    assert_eq!(materialize(&f, &btc, QueryKind::Current).await, CacheStatus::Success);
    assert_eq!(
        f.materializer.read(&btc, QueryKind::History).await.unwrap().status,
        CacheStatus::Absent
    );
}
