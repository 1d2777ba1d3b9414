//! Equities Poller
//!
//! Substitutes for streaming on the local equities market, which has no
//! push feed. Holds the trackable-symbol list and the streaming-equivalent
//! flag; the scheduler calls [`EquitiesPoller::tick`] on a short cadence and
//! [`EquitiesPoller::check_validity`] once a day before the open.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::application::ports::{EquitiesQuoteSource, SourceError, TimeSeriesError, TimeSeriesStore};
use crate::application::services::market_hours::MarketHours;
use crate::application::services::retry::{RetryError, RetryExecutor};
use crate::domain::asset::{Asset, AssetClass, AssetId, QueryKind};
use crate::domain::subscription::SubscriptionRegistry;

/// Poller error.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    /// Quote source kept failing.
    #[error(transparent)]
    Source(#[from] RetryError<SourceError>),

    /// Writing quotes failed.
    #[error(transparent)]
    Store(#[from] TimeSeriesError),
}

/// What one scheduler tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Streaming-equivalent updates are switched off.
    Disabled,
    /// Outside the polling window for this tick.
    Skipped,
    /// The list was empty and was rebuilt from subscriptions.
    Resynced {
        /// Stocks now tracked.
        tracked: usize,
    },
    /// Quotes were fetched and written.
    Polled {
        /// Quotes written.
        written: usize,
    },
}

/// Market-hours poller for local equities.
pub struct EquitiesPoller {
    registry: Arc<SubscriptionRegistry>,
    source: Arc<dyn EquitiesQuoteSource>,
    store: Arc<dyn TimeSeriesStore>,
    retry: RetryExecutor,
    max_attempts: u32,
    hours: MarketHours,
    trackable: RwLock<BTreeMap<AssetId, Asset>>,
    enabled: AtomicBool,
}

impl std::fmt::Debug for EquitiesPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EquitiesPoller")
            .field("trackable", &self.trackable.read().len())
            .field("enabled", &self.is_enabled())
            .field("hours", &self.hours)
            .finish_non_exhaustive()
    }
}

impl EquitiesPoller {
    /// Create a poller.
    #[must_use]
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        source: Arc<dyn EquitiesQuoteSource>,
        store: Arc<dyn TimeSeriesStore>,
        hours: MarketHours,
        max_attempts: u32,
        enabled: bool,
    ) -> Self {
        Self {
            registry,
            source,
            store,
            retry: RetryExecutor::new(),
            max_attempts,
            hours,
            trackable: RwLock::new(BTreeMap::new()),
            enabled: AtomicBool::new(enabled),
        }
    }

    /// Switch streaming-equivalent updates on or off.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        tracing::info!(enabled, "Equities polling toggled");
    }

    /// Whether streaming-equivalent updates are on.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Add a stock to the trackable list. Other classes are ignored.
    pub fn track(&self, asset: &Asset) {
        if asset.class() == AssetClass::StockTw {
            self.trackable.write().insert(asset.id(), asset.clone());
            tracing::debug!(asset = %asset, "Stock added to poll list");
        }
    }

    /// Remove a stock from the trackable list.
    pub fn untrack(&self, asset_id: AssetId) {
        if self.trackable.write().remove(&asset_id).is_some() {
            tracing::debug!(asset_id, "Stock removed from poll list");
        }
    }

    /// Current trackable list.
    #[must_use]
    pub fn trackable(&self) -> Vec<Asset> {
        self.trackable.read().values().cloned().collect()
    }

    /// Rebuild the trackable list from subscribed stocks the source still
    /// lists. Returns the new list length.
    ///
    /// Stocks tracked after the check began are kept, and stocks whose last
    /// subscriber left meanwhile are dropped.
    ///
    /// # Errors
    ///
    /// Returns the source error if a listing lookup keeps failing. The list
    /// is left unchanged in that case.
    pub async fn check_validity(&self) -> Result<usize, PollError> {
        let subscribed = self.registry.subscribed_assets(AssetClass::StockTw);
        let checked: BTreeSet<AssetId> = subscribed.iter().map(Asset::id).collect();
        let mut valid = BTreeMap::new();

        for stock in subscribed {
            let source = Arc::clone(&self.source);
            let listed = self
                .retry
                .with_retry(
                    |_| {
                        let source = Arc::clone(&source);
                        let stock = stock.clone();
                        async move { source.is_listed(&stock).await }
                    },
                    self.max_attempts,
                )
                .await?;

            if listed {
                valid.insert(stock.id(), stock);
            } else {
                tracing::warn!(asset = %stock, "Subscribed stock is no longer listed");
            }
        }

        let still_subscribed: BTreeSet<AssetId> = self
            .registry
            .subscribed_assets(AssetClass::StockTw)
            .iter()
            .map(Asset::id)
            .collect();
        valid.retain(|id, _| still_subscribed.contains(id));

        let mut trackable = self.trackable.write();
        for (id, stock) in trackable.iter() {
            if !checked.contains(id) {
                valid.insert(*id, stock.clone());
            }
        }
        *trackable = valid;
        let tracked = trackable.len();
        drop(trackable);
        tracing::info!(tracked, "Equities poll list rebuilt");
        Ok(tracked)
    }

    /// One scheduler tick at `now`.
    ///
    /// # Errors
    ///
    /// Returns the first source or store failure.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<PollOutcome, PollError> {
        if !self.is_enabled() {
            return Ok(PollOutcome::Disabled);
        }

        if self.trackable.read().is_empty() {
            let tracked = self.check_validity().await?;
            if tracked > 0 && self.hours.should_poll(now) {
                let written = self.poll().await?;
                return Ok(PollOutcome::Polled { written });
            }
            return Ok(PollOutcome::Resynced { tracked });
        }

        if !self.hours.should_poll(now) {
            return Ok(PollOutcome::Skipped);
        }

        let written = self.poll().await?;
        Ok(PollOutcome::Polled { written })
    }

    /// Fetch quotes for the trackable list and write them.
    ///
    /// # Errors
    ///
    /// Returns the source error after retries, or the first store error.
    pub async fn poll(&self) -> Result<usize, PollError> {
        let stocks = self.trackable();
        if stocks.is_empty() {
            return Ok(0);
        }

        let source = Arc::clone(&self.source);
        let ticks = self
            .retry
            .with_retry(
                |_| {
                    let source = Arc::clone(&source);
                    let stocks = stocks.clone();
                    async move { source.fetch_quotes(&stocks).await }
                },
                self.max_attempts,
            )
            .await?;

        let mut written = 0;
        for tick in ticks {
            let Some(stock) = stocks.iter().find(|s| s.symbol() == tick.symbol) else {
                tracing::debug!(symbol = %tick.symbol, "Quote for untracked stock, dropping");
                continue;
            };
            written += self
                .store
                .write(stock, QueryKind::Current, std::slice::from_ref(&tick))
                .await?;
        }

        tracing::debug!(stocks = stocks.len(), written, "Equities quotes written");
        Ok(written)
    }
}
