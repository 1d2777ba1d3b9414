//! Asynchronous Cache Materializer
//!
//! Decouples slow time-series queries from client requests. A request marks
//! the cache entry `processing`, runs the query on the worker pool and
//! returns a [`MaterializationHandle`] right away. The handle resolves to the
//! final status once the entry is written.
//!
//! # Protocol
//!
//! ```text
//! request ──► in flight? ──yes──► AlreadyProcessing
//!               │no
//!               ▼
//!          stored processing? ──yes──► AlreadyProcessing
//!               │no (or orphaned here)
//!               ▼
//!          status=processing ──► query ──► normalize ──► commit (status=success)
//!                                  │            │
//!                                  │ empty      │ error
//!                                  ▼            ▼
//!                     success (data kept)   status=error
//!                     or no_data
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::application::ports::{CacheError, CacheStore, TimeSeriesError, TimeSeriesStore};
use crate::application::services::worker_pool::{PoolError, WorkerPool};
use crate::domain::asset::{Asset, QueryKind};
use crate::domain::cache::{CacheEntry, CacheKey, CacheStatus, NormalizeError, normalize_records};

/// Default entry TTL: 168 hours.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(168 * 60 * 60);

/// Materializer error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MaterializeError {
    /// Cache store failed before work started.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The worker pool refused the task.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Reason a materialization attempt ended in `error`.
#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error(transparent)]
    Query(#[from] TimeSeriesError),

    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Result of a materialization request.
#[derive(Debug)]
pub enum MaterializeOutcome {
    /// A materialization for the key is already running. Nothing started.
    AlreadyProcessing,
    /// A materialization started.
    Started(MaterializationHandle),
}

/// Handle to one running materialization.
#[derive(Debug)]
pub struct MaterializationHandle {
    /// Task id, for logs and tracking.
    pub task_id: Uuid,
    /// Entry being written.
    pub key: CacheKey,
    done: oneshot::Receiver<CacheStatus>,
}

impl MaterializationHandle {
    /// Wait for the final status. A task cancelled by shutdown reports
    /// [`CacheStatus::Error`].
    pub async fn wait(self) -> CacheStatus {
        self.done.await.unwrap_or(CacheStatus::Error)
    }
}

/// Keys this process is working on.
#[derive(Debug, Default)]
struct Claims {
    /// Materializations running now.
    running: HashSet<CacheKey>,
    /// Entries this process marked `processing` whose task ended without
    /// writing a final status.
    orphaned: HashSet<CacheKey>,
}

/// Releases a key when the task ends, however it ends. A key still marked
/// `processing` when the guard drops is recorded as orphaned.
struct InFlightGuard {
    claims: Arc<Mutex<Claims>>,
    key: CacheKey,
    marked: bool,
}

impl InFlightGuard {
    const fn mark(&mut self) {
        self.marked = true;
    }

    fn settle(mut self) {
        self.marked = false;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut claims = self.claims.lock();
        claims.running.remove(&self.key);
        if self.marked {
            claims.orphaned.insert(self.key);
        }
    }
}

/// Populates cache entries from the time-series store.
pub struct CacheMaterializer {
    store: Arc<dyn TimeSeriesStore>,
    cache: Arc<dyn CacheStore>,
    pool: WorkerPool,
    ttl: Duration,
    claims: Arc<Mutex<Claims>>,
}

impl std::fmt::Debug for CacheMaterializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheMaterializer")
            .field("ttl", &self.ttl)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl CacheMaterializer {
    /// Create a materializer.
    #[must_use]
    pub fn new(
        store: Arc<dyn TimeSeriesStore>,
        cache: Arc<dyn CacheStore>,
        pool: WorkerPool,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            pool,
            ttl,
            claims: Arc::new(Mutex::new(Claims::default())),
        }
    }

    /// Number of materializations running in this process.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.claims.lock().running.len()
    }

    /// Start materializing `(asset, kind)`.
    ///
    /// With no `since`, the query resumes after the newest cached timestamp,
    /// or reads everything for a fresh entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be read or marked, or the pool is
    /// shutting down. The entry is left as it was, or marked `error` if it was
    /// already marked `processing`.
    #[tracing::instrument(skip(self, asset), fields(asset = %asset))]
    pub async fn request(
        &self,
        asset: &Asset,
        kind: QueryKind,
        since: Option<DateTime<Utc>>,
    ) -> Result<MaterializeOutcome, MaterializeError> {
        let key = CacheKey::for_asset(asset, kind);

        if !self.claims.lock().running.insert(key) {
            tracing::debug!(%key, "Materialization already in flight");
            return Ok(MaterializeOutcome::AlreadyProcessing);
        }
        let mut guard = InFlightGuard {
            claims: Arc::clone(&self.claims),
            key,
            marked: false,
        };

        // another process may own the entry, unless it is ours and orphaned
        if self.cache.status(&key).await? == CacheStatus::Processing
            && !self.claims.lock().orphaned.contains(&key)
        {
            tracing::debug!(%key, "Entry already processing");
            return Ok(MaterializeOutcome::AlreadyProcessing);
        }

        let since = match since {
            Some(since) => Some(since),
            None => self.resume_cursor(&key).await?,
        };

        self.cache
            .set_status(&key, CacheStatus::Processing, self.ttl)
            .await?;
        guard.mark();
        self.claims.lock().orphaned.remove(&key);

        let task_id = Uuid::new_v4();
        let (done_tx, done_rx) = oneshot::channel();
        let store = Arc::clone(&self.store);
        let cache = Arc::clone(&self.cache);
        let asset = asset.clone();
        let ttl = self.ttl;

        let spawned = self.pool.spawn(async move {
            let (status, settled) =
                run_attempt(store.as_ref(), cache.as_ref(), &asset, key, since, ttl).await;
            if settled {
                guard.settle();
            } else {
                drop(guard);
            }
            let _ = done_tx.send(status);
        });

        // a refused task has already dropped its guard and left the key orphaned
        if let Err(e) = spawned {
            self.settle_error(key).await;
            return Err(e.into());
        }

        tracing::debug!(%key, %task_id, ?since, "Materialization started");
        Ok(MaterializeOutcome::Started(MaterializationHandle {
            task_id,
            key,
            done: done_rx,
        }))
    }

    /// Snapshot of an entry.
    ///
    /// # Errors
    ///
    /// Returns the cache store error.
    pub async fn read(&self, asset: &Asset, kind: QueryKind) -> Result<CacheEntry, CacheError> {
        self.cache.read(&CacheKey::for_asset(asset, kind)).await
    }

    /// Mark every entry still running, or left `processing` by a task that
    /// was cancelled or could not record its outcome, as `error`. Returns how
    /// many were marked.
    pub async fn fail_in_flight(&self) -> usize {
        let keys: Vec<CacheKey> = {
            let claims = self.claims.lock();
            claims.running.union(&claims.orphaned).copied().collect()
        };
        let mut marked = 0;
        for key in keys {
            if self.settle_error(key).await {
                marked += 1;
            }
        }
        if marked > 0 {
            tracing::warn!(count = marked, "Marked in-flight materializations as error");
        }
        marked
    }

    async fn settle_error(&self, key: CacheKey) -> bool {
        match self.cache.set_status(&key, CacheStatus::Error, self.ttl).await {
            Ok(()) => {
                self.claims.lock().orphaned.remove(&key);
                true
            }
            Err(e) => {
                tracing::warn!(%key, error = %e, "Failed to mark entry as error");
                false
            }
        }
    }

    async fn resume_cursor(&self, key: &CacheKey) -> Result<Option<DateTime<Utc>>, CacheError> {
        let Some(last) = self.cache.last_timestamp(key).await? else {
            return Ok(None);
        };
        match DateTime::parse_from_rfc3339(&last) {
            Ok(time) => Ok(Some(time.with_timezone(&Utc))),
            Err(e) => {
                tracing::warn!(%key, last, error = %e, "Unreadable last timestamp, re-reading all");
                Ok(None)
            }
        }
    }
}

/// Returns the final status and whether it reached the cache.
async fn run_attempt(
    store: &dyn TimeSeriesStore,
    cache: &dyn CacheStore,
    asset: &Asset,
    key: CacheKey,
    since: Option<DateTime<Utc>>,
    ttl: Duration,
) -> (CacheStatus, bool) {
    let (status, settled) = match attempt(store, cache, asset, key, since, ttl).await {
        Ok(status) => (status, true),
        Err(e) => {
            tracing::warn!(%key, error = %e, "Materialization failed");
            let recorded = match cache.set_status(&key, CacheStatus::Error, ttl).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!(%key, error = %e, "Failed to record materialization error");
                    false
                }
            };
            (CacheStatus::Error, recorded)
        }
    };

    metrics::counter!(
        "materializations_total",
        "kind" => key.kind.as_str(),
        "outcome" => status.as_str()
    )
    .increment(1);
    tracing::debug!(%key, %status, "Materialization finished");
    (status, settled)
}

async fn attempt(
    store: &dyn TimeSeriesStore,
    cache: &dyn CacheStore,
    asset: &Asset,
    key: CacheKey,
    since: Option<DateTime<Utc>>,
    ttl: Duration,
) -> Result<CacheStatus, AttemptError> {
    let records = store.query(asset, key.kind, since).await?;

    if let Some(batch) = normalize_records(&records)? {
        cache.commit(&key, &batch, ttl).await?;
        return Ok(CacheStatus::Success);
    }

    // nothing new; an entry with earlier batches stays valid
    let status = if cache.batch_count(&key).await? > 0 {
        CacheStatus::Success
    } else {
        CacheStatus::NoData
    };
    cache.set_status(&key, status, ttl).await?;
    Ok(status)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use tokio::sync::Notify;

    use super::*;
    use crate::domain::cache::NormalizedBatch;
    use crate::domain::market_data::{SeriesRecord, Tick};
    use crate::infrastructure::cache::InMemoryCacheStore;
    use crate::infrastructure::timeseries::InMemoryTimeSeriesStore;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn bar(symbol: &str, secs: i64, close: i64) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            time: at(secs),
            open: Decimal::new(close, 0),
            high: Decimal::new(close, 0),
            low: Decimal::new(close, 0),
            close: Decimal::new(close, 0),
            volume: Decimal::ONE,
        }
    }

    fn materializer(
        store: Arc<dyn TimeSeriesStore>,
    ) -> (CacheMaterializer, Arc<InMemoryCacheStore>) {
        let cache = Arc::new(InMemoryCacheStore::new());
        let materializer = CacheMaterializer::new(
            store,
            Arc::clone(&cache) as Arc<dyn CacheStore>,
            WorkerPool::new(4),
            DEFAULT_CACHE_TTL,
        );
        (materializer, cache)
    }

    async fn run(materializer: &CacheMaterializer, asset: &Asset) -> CacheStatus {
        match materializer.request(asset, QueryKind::History, None).await.unwrap() {
            MaterializeOutcome::Started(handle) => handle.wait().await,
            MaterializeOutcome::AlreadyProcessing => panic!("unexpected in-flight entry"),
        }
    }

    /// Blocks every query until released and counts calls.
    struct GatedStore {
        gate: Notify,
        queries: AtomicUsize,
    }

    #[async_trait]
    impl TimeSeriesStore for GatedStore {
        async fn write(&self, _: &Asset, _: QueryKind, ticks: &[Tick]) -> Result<usize, TimeSeriesError> {
            Ok(ticks.len())
        }

        async fn query(
            &self,
            _: &Asset,
            _: QueryKind,
            _: Option<DateTime<Utc>>,
        ) -> Result<Vec<SeriesRecord>, TimeSeriesError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            Ok(vec![SeriesRecord::new(at(0), "close", 1.0)])
        }

        async fn latest_timestamp(
            &self,
            _: &Asset,
            _: QueryKind,
        ) -> Result<Option<DateTime<Utc>>, TimeSeriesError> {
            Ok(None)
        }

        async fn delete_asset(&self, _: &Asset) -> Result<(), TimeSeriesError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn success_records_latest_timestamp() {
        let store = Arc::new(InMemoryTimeSeriesStore::new());
        let btc = Asset::crypto(1, "BTCUSDT");
        store
            .write(&btc, QueryKind::History, &[bar("BTCUSDT", 0, 10), bar("BTCUSDT", 86_400, 11)])
            .await
            .unwrap();
        let (materializer, _) = materializer(store);

        assert_eq!(run(&materializer, &btc).await, CacheStatus::Success);

        let entry = materializer.read(&btc, QueryKind::History).await.unwrap();
        assert_eq!(entry.status, CacheStatus::Success);
        assert_eq!(entry.records.len(), 2);
        assert_eq!(entry.last_timestamp.as_deref(), Some("1970-01-02T00:00:00.000Z"));
    }

    #[tokio::test]
    async fn empty_store_yields_no_data() {
        let (materializer, _) = materializer(Arc::new(InMemoryTimeSeriesStore::new()));
        let asset = Asset::crypto(1, "BTCUSDT");

        assert_eq!(run(&materializer, &asset).await, CacheStatus::NoData);

        let entry = materializer.read(&asset, QueryKind::History).await.unwrap();
        assert_eq!(entry.status, CacheStatus::NoData);
        assert!(entry.records.is_empty());
    }

    #[tokio::test]
    async fn rerun_without_new_records_keeps_success() {
        let store = Arc::new(InMemoryTimeSeriesStore::new());
        let btc = Asset::crypto(1, "BTCUSDT");
        store.write(&btc, QueryKind::History, &[bar("BTCUSDT", 0, 10)]).await.unwrap();
        let (materializer, cache) = materializer(Arc::clone(&store) as Arc<dyn TimeSeriesStore>);

        assert_eq!(run(&materializer, &btc).await, CacheStatus::Success);
        assert_eq!(run(&materializer, &btc).await, CacheStatus::Success);

        let key = CacheKey::for_asset(&btc, QueryKind::History);
        assert_eq!(cache.batch_count(&key).await.unwrap(), 1);

        // only the newer bar is appended
        store.write(&btc, QueryKind::History, &[bar("BTCUSDT", 60, 12)]).await.unwrap();
        assert_eq!(run(&materializer, &btc).await, CacheStatus::Success);
        assert_eq!(cache.batch_count(&key).await.unwrap(), 2);
        assert_eq!(materializer.read(&btc, QueryKind::History).await.unwrap().records.len(), 2);
    }

    #[tokio::test]
    async fn second_request_while_processing_is_rejected() {
        let store = Arc::new(GatedStore {
            gate: Notify::new(),
            queries: AtomicUsize::new(0),
        });
        let (materializer, _) = materializer(Arc::clone(&store) as Arc<dyn TimeSeriesStore>);
        let asset = Asset::crypto(1, "BTCUSDT");

        let first = materializer.request(&asset, QueryKind::Current, None).await.unwrap();
        let second = materializer.request(&asset, QueryKind::Current, None).await.unwrap();

        assert!(matches!(second, MaterializeOutcome::AlreadyProcessing));
        assert_eq!(
            materializer.read(&asset, QueryKind::Current).await.unwrap().status,
            CacheStatus::Processing
        );

        let MaterializeOutcome::Started(handle) = first else {
            panic!("first request should start");
        };
        store.gate.notify_one();
        assert_eq!(handle.wait().await, CacheStatus::Success);
        assert_eq!(store.queries.load(Ordering::SeqCst), 1);
        assert_eq!(materializer.in_flight(), 0);
    }

    #[tokio::test]
    async fn stored_processing_from_elsewhere_is_respected() {
        let (materializer, cache) = materializer(Arc::new(InMemoryTimeSeriesStore::new()));
        let asset = Asset::crypto(1, "BTCUSDT");
        let key = CacheKey::for_asset(&asset, QueryKind::History);
        cache
            .set_status(&key, CacheStatus::Processing, DEFAULT_CACHE_TTL)
            .await
            .unwrap();

        let outcome = materializer.request(&asset, QueryKind::History, None).await.unwrap();

        assert!(matches!(outcome, MaterializeOutcome::AlreadyProcessing));
        assert_eq!(materializer.in_flight(), 0);
    }

    #[tokio::test]
    async fn unknown_field_sets_error_without_partial_data() {
        let store = Arc::new(InMemoryTimeSeriesStore::new());
        let asset = Asset::crypto(1, "BTCUSDT");
        store.insert_raw(&asset, QueryKind::History, SeriesRecord::new(at(0), "close", 1.0));
        store.insert_raw(&asset, QueryKind::History, SeriesRecord::new(at(0), "vwap", 1.0));
        let (materializer, _) = materializer(store);

        assert_eq!(run(&materializer, &asset).await, CacheStatus::Error);

        let entry = materializer.read(&asset, QueryKind::History).await.unwrap();
        assert_eq!(entry.status, CacheStatus::Error);
        assert!(entry.records.is_empty());
    }

    #[tokio::test]
    async fn shutdown_marks_in_flight_entries_error() {
        let store = Arc::new(GatedStore {
            gate: Notify::new(),
            queries: AtomicUsize::new(0),
        });
        let (materializer, cache) = materializer(store);
        let asset = Asset::crypto(1, "BTCUSDT");

        let _pending = materializer.request(&asset, QueryKind::History, None).await.unwrap();

        assert_eq!(materializer.fail_in_flight().await, 1);
        let key = CacheKey::for_asset(&asset, QueryKind::History);
        assert_eq!(cache.status(&key).await.unwrap(), CacheStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_timeout_then_fail_in_flight_marks_cancelled_entries() {
        let store = Arc::new(GatedStore {
            gate: Notify::new(),
            queries: AtomicUsize::new(0),
        });
        let cache = Arc::new(InMemoryCacheStore::new());
        let pool = WorkerPool::new(2);
        let materializer = CacheMaterializer::new(
            store,
            Arc::clone(&cache) as Arc<dyn CacheStore>,
            pool.clone(),
            DEFAULT_CACHE_TTL,
        );
        let asset = Asset::crypto(1, "BTCUSDT");
        let key = CacheKey::for_asset(&asset, QueryKind::History);

        let MaterializeOutcome::Started(handle) =
            materializer.request(&asset, QueryKind::History, None).await.unwrap()
        else {
            panic!("request should start");
        };

        // same order as process shutdown: drain the pool, then settle entries
        assert!(!pool.shutdown(Duration::from_millis(50)).await);
        assert_eq!(handle.wait().await, CacheStatus::Error);
        assert_eq!(materializer.in_flight(), 0);

        assert_eq!(materializer.fail_in_flight().await, 1);
        assert_eq!(cache.status(&key).await.unwrap(), CacheStatus::Error);
        assert_eq!(materializer.fail_in_flight().await, 0);
    }

    /// In-memory cache whose `error` status writes can be made to fail.
    struct FlakyCache {
        inner: InMemoryCacheStore,
        fail_error_writes: AtomicBool,
    }

    #[async_trait]
    impl CacheStore for FlakyCache {
        async fn status(&self, key: &CacheKey) -> Result<CacheStatus, CacheError> {
            self.inner.status(key).await
        }

        async fn set_status(
            &self,
            key: &CacheKey,
            status: CacheStatus,
            ttl: Duration,
        ) -> Result<(), CacheError> {
            if status == CacheStatus::Error && self.fail_error_writes.load(Ordering::SeqCst) {
                return Err(CacheError::Connection {
                    message: "connection reset".to_string(),
                });
            }
            self.inner.set_status(key, status, ttl).await
        }

        async fn last_timestamp(&self, key: &CacheKey) -> Result<Option<String>, CacheError> {
            self.inner.last_timestamp(key).await
        }

        async fn batch_count(&self, key: &CacheKey) -> Result<usize, CacheError> {
            self.inner.batch_count(key).await
        }

        async fn commit(
            &self,
            key: &CacheKey,
            batch: &NormalizedBatch,
            ttl: Duration,
        ) -> Result<(), CacheError> {
            self.inner.commit(key, batch, ttl).await
        }

        async fn read(&self, key: &CacheKey) -> Result<CacheEntry, CacheError> {
            self.inner.read(key).await
        }
    }

    #[tokio::test]
    async fn unrecorded_error_does_not_block_later_requests() {
        let store = Arc::new(InMemoryTimeSeriesStore::new());
        let asset = Asset::crypto(1, "BTCUSDT");
        store.insert_raw(&asset, QueryKind::History, SeriesRecord::new(at(0), "vwap", 1.0));
        let cache = Arc::new(FlakyCache {
            inner: InMemoryCacheStore::new(),
            fail_error_writes: AtomicBool::new(true),
        });
        let materializer = CacheMaterializer::new(
            store,
            Arc::clone(&cache) as Arc<dyn CacheStore>,
            WorkerPool::new(2),
            DEFAULT_CACHE_TTL,
        );
        let key = CacheKey::for_asset(&asset, QueryKind::History);

        assert_eq!(run(&materializer, &asset).await, CacheStatus::Error);
        assert_eq!(cache.status(&key).await.unwrap(), CacheStatus::Processing);

        // the stale processing mark is ours, so the next request runs
        cache.fail_error_writes.store(false, Ordering::SeqCst);
        assert_eq!(run(&materializer, &asset).await, CacheStatus::Error);
        assert_eq!(cache.status(&key).await.unwrap(), CacheStatus::Error);
        assert_eq!(materializer.fail_in_flight().await, 0);
    }
}
