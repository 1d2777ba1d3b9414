//! Historical Backfill
//!
//! Fills daily history for subscribed assets. Each run reads the newest
//! stored bar and only asks the source for what comes after it, so repeated
//! runs are cheap and never duplicate a day.
//!
//! Also consumes subscription changes: a new asset is backfilled right away,
//! and a dropped asset's history is deleted when the retention policy for
//! its class says so.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{HistorySource, SourceError, TimeSeriesError, TimeSeriesStore};
use crate::application::services::coordinator::{ChangeAction, SubscriptionChange};
use crate::application::services::progress::{ProgressTracker, TaskStatus};
use crate::application::services::retry::{RetryError, RetryExecutor};
use crate::application::services::worker_pool::WorkerPool;
use crate::domain::asset::{Asset, AssetClass, QueryKind};
use crate::domain::subscription::SubscriptionRegistry;

/// Default lookback for an asset with no stored history.
pub const DEFAULT_LOOKBACK_DAYS: i64 = 365;

/// Backfill error.
#[derive(Debug, thiserror::Error)]
pub enum BackfillError {
    /// History source kept failing.
    #[error(transparent)]
    Source(#[from] RetryError<SourceError>),

    /// Reading or writing the store failed.
    #[error(transparent)]
    Store(#[from] TimeSeriesError),
}

/// What happens to stored history when an asset loses its last subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HistoryRetention {
    /// Keep history for a later resubscribe.
    #[default]
    Keep,
    /// Delete the asset's series.
    DeleteOnLastUnsubscribe,
}

impl HistoryRetention {
    /// Parse `keep` or `delete`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "keep" => Some(Self::Keep),
            "delete" => Some(Self::DeleteOnLastUnsubscribe),
            _ => None,
        }
    }
}

/// Retention per asset class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Crypto pairs.
    pub crypto: HistoryRetention,
    /// Local equities.
    pub stock_tw: HistoryRetention,
    /// Currencies.
    pub currency: HistoryRetention,
}

impl RetentionPolicy {
    /// Retention for a class.
    #[must_use]
    pub const fn for_class(&self, class: AssetClass) -> HistoryRetention {
        match class {
            AssetClass::Crypto => self.crypto,
            AssetClass::StockTw => self.stock_tw,
            AssetClass::Currency => self.currency,
        }
    }
}

/// Totals of a multi-asset run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillSummary {
    /// Assets visited.
    pub assets: usize,
    /// Bars written.
    pub written: usize,
    /// Assets whose backfill failed.
    pub failed: usize,
}

/// Daily history backfill.
pub struct BackfillService {
    store: Arc<dyn TimeSeriesStore>,
    crypto_history: Arc<dyn HistorySource>,
    stock_history: Arc<dyn HistorySource>,
    registry: Arc<SubscriptionRegistry>,
    progress: Arc<ProgressTracker>,
    retention: RetentionPolicy,
    retry: RetryExecutor,
    max_attempts: u32,
    lookback: chrono::Duration,
}

impl std::fmt::Debug for BackfillService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackfillService")
            .field("retention", &self.retention)
            .field("max_attempts", &self.max_attempts)
            .field("lookback", &self.lookback)
            .finish_non_exhaustive()
    }
}

impl BackfillService {
    /// Create a backfill service.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TimeSeriesStore>,
        crypto_history: Arc<dyn HistorySource>,
        stock_history: Arc<dyn HistorySource>,
        registry: Arc<SubscriptionRegistry>,
        progress: Arc<ProgressTracker>,
        retention: RetentionPolicy,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            crypto_history,
            stock_history,
            registry,
            progress,
            retention,
            retry: RetryExecutor::new(),
            max_attempts,
            lookback: chrono::Duration::days(DEFAULT_LOOKBACK_DAYS),
        }
    }

    fn source_for(&self, asset: &Asset) -> Option<&Arc<dyn HistorySource>> {
        match asset {
            Asset::Crypto { .. } => Some(&self.crypto_history),
            Asset::StockTw { .. } => Some(&self.stock_history),
            // rates are recorded by the currency refresh
            Asset::Currency { .. } => None,
        }
    }

    /// Backfill one asset. Returns the number of bars written.
    ///
    /// # Errors
    ///
    /// Returns the source error after retries, or the store error.
    #[tracing::instrument(skip(self, asset), fields(asset = %asset))]
    pub async fn backfill(&self, asset: &Asset) -> Result<usize, BackfillError> {
        let Some(source) = self.source_for(asset) else {
            return Ok(0);
        };

        let latest = self.store.latest_timestamp(asset, QueryKind::History).await?;
        let since = latest.unwrap_or_else(|| Utc::now() - self.lookback);
        let task = self.progress.create(format!("backfill {asset}"), 1);

        let result = self.fetch_and_write(source, asset, since, latest).await;
        match &result {
            Ok(written) => {
                self.progress.increment(task, 1);
                self.progress
                    .complete(task, TaskStatus::Success, Some(format!("{written} bars")));
                tracing::info!(written, "Backfill finished");
            }
            Err(e) => {
                self.progress
                    .complete(task, TaskStatus::Failed, Some(e.to_string()));
                tracing::warn!(error = %e, "Backfill failed");
            }
        }
        result
    }

    async fn fetch_and_write(
        &self,
        source: &Arc<dyn HistorySource>,
        asset: &Asset,
        since: DateTime<Utc>,
        latest: Option<DateTime<Utc>>,
    ) -> Result<usize, BackfillError> {
        let bars = self
            .retry
            .with_retry(
                |_| {
                    let source = Arc::clone(source);
                    let asset = asset.clone();
                    async move { source.daily_bars(&asset, Some(since)).await }
                },
                self.max_attempts,
            )
            .await?;

        let fresh: Vec<_> = bars
            .into_iter()
            .filter(|bar| latest.is_none_or(|latest| bar.time > latest))
            .collect();
        if fresh.is_empty() {
            return Ok(0);
        }

        Ok(self.store.write(asset, QueryKind::History, &fresh).await?)
    }

    /// Backfill every subscribed asset of a class.
    pub async fn backfill_class(&self, class: AssetClass) -> BackfillSummary {
        let mut summary = BackfillSummary::default();
        for asset in self.registry.subscribed_assets(class) {
            summary.assets += 1;
            match self.backfill(&asset).await {
                Ok(written) => summary.written += written,
                Err(_) => summary.failed += 1,
            }
        }
        summary
    }

    /// Backfill every subscribed asset with no stored history at all.
    pub async fn check_integrity(&self) -> BackfillSummary {
        let mut summary = BackfillSummary::default();
        for asset in self.registry.assets() {
            if self.source_for(&asset).is_none() {
                continue;
            }
            match self.store.latest_timestamp(&asset, QueryKind::History).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    summary.assets += 1;
                    tracing::info!(asset = %asset, "History missing, backfilling");
                    match self.backfill(&asset).await {
                        Ok(written) => summary.written += written,
                        Err(_) => summary.failed += 1,
                    }
                }
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(asset = %asset, error = %e, "History check failed");
                }
            }
        }
        summary
    }

    /// React to one subscription change.
    ///
    /// # Errors
    ///
    /// Returns the backfill or delete error.
    pub async fn handle_change(&self, change: &SubscriptionChange) -> Result<(), BackfillError> {
        match change.action {
            ChangeAction::Add => {
                self.backfill(&change.asset).await?;
            }
            ChangeAction::Remove => {
                if self.retention.for_class(change.asset.class())
                    == HistoryRetention::DeleteOnLastUnsubscribe
                {
                    self.store.delete_asset(&change.asset).await?;
                    tracing::info!(asset = %change.asset, "Deleted history of unsubscribed asset");
                }
            }
        }
        Ok(())
    }

    /// Consume subscription changes until cancelled. Each change runs on the
    /// worker pool.
    pub async fn run_consumer(
        self: Arc<Self>,
        mut changes: broadcast::Receiver<SubscriptionChange>,
        pool: WorkerPool,
        cancel: CancellationToken,
    ) {
        loop {
            let change = tokio::select! {
                () = cancel.cancelled() => break,
                change = changes.recv() => change,
            };

            match change {
                Ok(change) => {
                    let service = Arc::clone(&self);
                    let spawned = pool.spawn(async move {
                        if let Err(e) = service.handle_change(&change).await {
                            tracing::warn!(asset = %change.asset, error = %e, "Backfill change failed");
                        }
                    });
                    if spawned.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    // the integrity job covers any asset whose Add was missed
                    tracing::warn!(missed, "Backfill consumer lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::debug!("Backfill consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::asset::{DEFAULT_CHANNEL, TwMarket};
    use crate::domain::market_data::Tick;
    use crate::infrastructure::timeseries::InMemoryTimeSeriesStore;

    fn day(n: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + n * 86_400, 0).unwrap()
    }

    /// Serves bars for days 0..=`last_day`, honoring `since`.
    struct FakeHistory {
        last_day: i64,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HistorySource for FakeHistory {
        async fn daily_bars(
            &self,
            asset: &Asset,
            since: Option<DateTime<Utc>>,
        ) -> Result<Vec<Tick>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((0..=self.last_day)
                .map(day)
                .filter(|time| since.is_none_or(|since| *time > since))
                .map(|time| Tick::rate(asset.symbol(), time, Decimal::ONE))
                .collect())
        }
    }

    struct Fixture {
        store: Arc<InMemoryTimeSeriesStore>,
        history: Arc<FakeHistory>,
        registry: Arc<SubscriptionRegistry>,
        progress: Arc<ProgressTracker>,
        service: BackfillService,
    }

    fn fixture(retention: RetentionPolicy) -> Fixture {
        let store = Arc::new(InMemoryTimeSeriesStore::new());
        let history = Arc::new(FakeHistory {
            last_day: 2,
            calls: AtomicUsize::new(0),
        });
        let registry = Arc::new(SubscriptionRegistry::new());
        let progress = Arc::new(ProgressTracker::new());
        let mut service = BackfillService::new(
            Arc::clone(&store) as Arc<dyn TimeSeriesStore>,
            Arc::clone(&history) as Arc<dyn HistorySource>,
            Arc::clone(&history) as Arc<dyn HistorySource>,
            Arc::clone(&registry),
            Arc::clone(&progress),
            retention,
            3,
        );
        // fake history starts in 2023
        service.lookback = chrono::Duration::days(365 * 20);
        Fixture {
            store,
            history,
            registry,
            progress,
            service,
        }
    }

    #[tokio::test]
    async fn second_run_writes_nothing_new() {
        let f = fixture(RetentionPolicy::default());
        let btc = Asset::crypto(1, "BTCUSDT");

        assert_eq!(f.service.backfill(&btc).await.unwrap(), 3);
        assert_eq!(f.service.backfill(&btc).await.unwrap(), 0);

        assert_eq!(
            f.store.latest_timestamp(&btc, QueryKind::History).await.unwrap(),
            Some(day(2))
        );
        let tasks = f.progress.list();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Success));
    }

    #[tokio::test]
    async fn currency_has_no_history_source() {
        let f = fixture(RetentionPolicy::default());

        assert_eq!(f.service.backfill(&Asset::currency(1, "TWD")).await.unwrap(), 0);
        assert_eq!(f.history.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn integrity_check_only_fills_missing_history() {
        let f = fixture(RetentionPolicy::default());
        let btc = Asset::crypto(1, "BTCUSDT");
        let tsmc = Asset::stock_tw(2, "2330", TwMarket::Twse);
        f.registry.subscribe(1, &btc, DEFAULT_CHANNEL);
        f.registry.subscribe(1, &tsmc, DEFAULT_CHANNEL);
        f.service.backfill(&btc).await.unwrap();

        let summary = f.service.check_integrity().await;

        assert_eq!(summary, BackfillSummary { assets: 1, written: 3, failed: 0 });
    }

    #[tokio::test]
    async fn removal_deletes_history_only_when_configured() {
        let retention = RetentionPolicy {
            crypto: HistoryRetention::DeleteOnLastUnsubscribe,
            ..RetentionPolicy::default()
        };
        let f = fixture(retention);
        let btc = Asset::crypto(1, "BTCUSDT");
        let tsmc = Asset::stock_tw(2, "2330", TwMarket::Twse);
        f.service.backfill(&btc).await.unwrap();
        f.service.backfill(&tsmc).await.unwrap();

        for asset in [&btc, &tsmc] {
            let change = SubscriptionChange {
                asset: asset.clone(),
                channel: DEFAULT_CHANNEL.to_string(),
                action: ChangeAction::Remove,
            };
            f.service.handle_change(&change).await.unwrap();
        }

        assert_eq!(f.store.latest_timestamp(&btc, QueryKind::History).await.unwrap(), None);
        assert!(f.store.latest_timestamp(&tsmc, QueryKind::History).await.unwrap().is_some());
    }

    #[test]
    fn retention_parsing() {
        assert_eq!(HistoryRetention::parse("keep"), Some(HistoryRetention::Keep));
        assert_eq!(
            HistoryRetention::parse(" Delete "),
            Some(HistoryRetention::DeleteOnLastUnsubscribe)
        );
        assert_eq!(HistoryRetention::parse("grace"), None);
    }
}
