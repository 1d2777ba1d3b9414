//! Currency rate refresh.
//!
//! Currencies have neither a push feed nor a history endpoint. The refresh
//! job records the latest rate of every tracked currency into both series,
//! which builds their history over time.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;

use crate::application::ports::{CurrencyRateSource, SourceError, TimeSeriesError, TimeSeriesStore};
use crate::application::services::retry::{RetryError, RetryExecutor};
use crate::domain::asset::{Asset, AssetClass, QueryKind};
use crate::domain::market_data::Tick;
use crate::domain::subscription::SubscriptionRegistry;

/// Currency refresh error.
#[derive(Debug, thiserror::Error)]
pub enum CurrencyRefreshError {
    /// Rate source kept failing.
    #[error(transparent)]
    Source(#[from] RetryError<SourceError>),

    /// Writing rates failed.
    #[error(transparent)]
    Store(#[from] TimeSeriesError),
}

/// Records exchange rates for tracked currencies.
pub struct CurrencyRefresher {
    source: Arc<dyn CurrencyRateSource>,
    store: Arc<dyn TimeSeriesStore>,
    registry: Arc<SubscriptionRegistry>,
    base_currency: String,
    retry: RetryExecutor,
    max_attempts: u32,
}

impl std::fmt::Debug for CurrencyRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CurrencyRefresher")
            .field("base_currency", &self.base_currency)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl CurrencyRefresher {
    /// Create a refresher. Rates are quoted per unit of `base_currency`.
    #[must_use]
    pub fn new(
        source: Arc<dyn CurrencyRateSource>,
        store: Arc<dyn TimeSeriesStore>,
        registry: Arc<SubscriptionRegistry>,
        base_currency: impl Into<String>,
        max_attempts: u32,
    ) -> Self {
        Self {
            source,
            store,
            registry,
            base_currency: base_currency.into().to_uppercase(),
            retry: RetryExecutor::new(),
            max_attempts,
        }
    }

    /// Fetch rates and record one tick per tracked currency. Returns the
    /// number of currencies updated.
    ///
    /// # Errors
    ///
    /// Returns the source error after retries, or the first store error.
    pub async fn refresh(&self) -> Result<usize, CurrencyRefreshError> {
        let tracked: Vec<Asset> = self
            .registry
            .assets()
            .into_iter()
            .filter(|asset| asset.class() == AssetClass::Currency)
            .collect();
        if tracked.is_empty() {
            return Ok(0);
        }

        let source = Arc::clone(&self.source);
        let rates = self
            .retry
            .with_retry(
                |_| {
                    let source = Arc::clone(&source);
                    async move { source.latest_rates().await }
                },
                self.max_attempts,
            )
            .await?;

        let mut updated = 0;
        for asset in &tracked {
            let tick = if asset.symbol() == self.base_currency {
                Tick::rate(asset.symbol(), Utc::now(), Decimal::ONE)
            } else if let Some(rate) = rates.iter().find(|r| r.code == asset.symbol()) {
                Tick::rate(asset.symbol(), rate.time, rate.rate)
            } else {
                tracing::debug!(asset = %asset, "No rate published for currency");
                continue;
            };

            let ticks = std::slice::from_ref(&tick);
            self.store.write(asset, QueryKind::Current, ticks).await?;
            self.store.write(asset, QueryKind::History, ticks).await?;
            updated += 1;
        }

        tracing::info!(updated, tracked = tracked.len(), "Currency rates refreshed");
        Ok(updated)
    }
}
