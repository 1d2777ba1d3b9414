//! Tick ingestion from the exchange feed into the time-series store.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::TimeSeriesStore;
use crate::application::services::retry::RetryExecutor;
use crate::domain::asset::QueryKind;
use crate::domain::market_data::Tick;
use crate::domain::subscription::SubscriptionRegistry;

/// Counters of one ingestion run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Ticks written.
    pub written: u64,
    /// Ticks for symbols no longer subscribed.
    pub unmatched: u64,
    /// Ticks dropped after write retries ran out.
    pub failed: u64,
}

/// Writes feed ticks to the store in arrival order.
pub struct TickIngestor {
    store: Arc<dyn TimeSeriesStore>,
    registry: Arc<SubscriptionRegistry>,
    retry: RetryExecutor,
    max_attempts: u32,
}

impl std::fmt::Debug for TickIngestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickIngestor")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl TickIngestor {
    /// Create an ingestor.
    #[must_use]
    pub fn new(
        store: Arc<dyn TimeSeriesStore>,
        registry: Arc<SubscriptionRegistry>,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            registry,
            retry: RetryExecutor::new(),
            max_attempts,
        }
    }

    /// Write one tick. Returns `false` if it was dropped.
    pub async fn ingest(&self, tick: Tick, stats: &mut IngestStats) -> bool {
        let Some(asset) = self.registry.find_by_feed_symbol(&tick.symbol) else {
            tracing::debug!(symbol = %tick.symbol, "Tick for unsubscribed symbol, dropping");
            stats.unmatched += 1;
            return false;
        };

        let store = Arc::clone(&self.store);
        let result = self
            .retry
            .with_retry(
                |_| {
                    let store = Arc::clone(&store);
                    let asset = asset.clone();
                    let tick = tick.clone();
                    async move {
                        store
                            .write(&asset, QueryKind::Current, std::slice::from_ref(&tick))
                            .await
                    }
                },
                self.max_attempts,
            )
            .await;

        match result {
            Ok(_) => {
                stats.written += 1;
                metrics::counter!("ticks_written_total").increment(1);
                true
            }
            Err(e) => {
                stats.failed += 1;
                tracing::warn!(symbol = %tick.symbol, error = %e, "Dropping tick");
                false
            }
        }
    }

    /// Drain ticks until the channel closes or `cancel` fires.
    pub async fn run(
        self: Arc<Self>,
        mut ticks: mpsc::Receiver<Tick>,
        cancel: CancellationToken,
    ) -> IngestStats {
        let mut stats = IngestStats::default();
        loop {
            let tick = tokio::select! {
                () = cancel.cancelled() => break,
                tick = ticks.recv() => tick,
            };
            let Some(tick) = tick else { break };
            self.ingest(tick, &mut stats).await;
        }
        tracing::info!(
            written = stats.written,
            unmatched = stats.unmatched,
            failed = stats.failed,
            "Tick ingestion stopped"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::asset::{Asset, DEFAULT_CHANNEL};
    use crate::infrastructure::timeseries::InMemoryTimeSeriesStore;

    #[tokio::test]
    async fn writes_subscribed_ticks_in_order_and_drops_others() {
        let store = Arc::new(InMemoryTimeSeriesStore::new());
        let registry = Arc::new(SubscriptionRegistry::new());
        let btc = Asset::crypto(1, "BTCUSDT");
        registry.subscribe(1, &btc, DEFAULT_CHANNEL);
        let ingestor = Arc::new(TickIngestor::new(
            Arc::clone(&store) as Arc<dyn TimeSeriesStore>,
            Arc::clone(&registry),
            3,
        ));

        let (tx, rx) = mpsc::channel(8);
        for (symbol, secs) in [("BTCUSDT", 0), ("ETHUSDT", 60), ("BTCUSDT", 60)] {
            let time = Utc.timestamp_opt(secs, 0).unwrap();
            tx.send(Tick::rate(symbol, time, Decimal::ONE)).await.unwrap();
        }
        drop(tx);

        let stats = ingestor.run(rx, CancellationToken::new()).await;

        assert_eq!(stats, IngestStats { written: 2, unmatched: 1, failed: 0 });
        let latest = store.latest_timestamp(&btc, QueryKind::Current).await.unwrap();
        assert_eq!(latest, Some(Utc.timestamp_opt(60, 0).unwrap()));
    }
}
