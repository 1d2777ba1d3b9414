//! Routes subscription changes to the feed or the equities poller.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::application::ports::FeedControl;
use crate::application::services::coordinator::{ChangeAction, SubscriptionChange};
use crate::application::services::equities::EquitiesPoller;
use crate::domain::asset::{Asset, AssetClass};
use crate::domain::subscription::SubscriptionRegistry;

/// Applies subscription changes to the live data sources.
pub struct FeedBridge {
    feed: Arc<dyn FeedControl>,
    poller: Arc<EquitiesPoller>,
    registry: Arc<SubscriptionRegistry>,
}

impl std::fmt::Debug for FeedBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedBridge").finish_non_exhaustive()
    }
}

impl FeedBridge {
    /// Create a bridge.
    #[must_use]
    pub fn new(
        feed: Arc<dyn FeedControl>,
        poller: Arc<EquitiesPoller>,
        registry: Arc<SubscriptionRegistry>,
    ) -> Self {
        Self {
            feed,
            poller,
            registry,
        }
    }

    /// Apply one change.
    pub fn apply(&self, change: &SubscriptionChange) {
        let asset = &change.asset;
        match asset {
            Asset::Crypto { .. } => {
                let Some(stream) = asset.feed_stream(&change.channel) else {
                    return;
                };
                match change.action {
                    ChangeAction::Add => self.feed.subscribe(stream),
                    ChangeAction::Remove => self.feed.unsubscribe(stream),
                }
            }
            Asset::StockTw { .. } => match change.action {
                ChangeAction::Add => self.poller.track(asset),
                ChangeAction::Remove => self.poller.untrack(asset.id()),
            },
            Asset::Currency { .. } => {}
        }
    }

    /// Bring the feed and poll list in line with the registry.
    pub fn reconcile(&self) {
        if self.registry.has_streamed_assets() {
            self.feed.ensure_connected();
        }
        for stock in self.registry.subscribed_assets(AssetClass::StockTw) {
            self.poller.track(&stock);
        }
    }

    /// Consume changes until cancelled.
    pub async fn run(
        self: Arc<Self>,
        mut changes: broadcast::Receiver<SubscriptionChange>,
        cancel: CancellationToken,
    ) {
        self.reconcile();
        loop {
            let change = tokio::select! {
                () = cancel.cancelled() => break,
                change = changes.recv() => change,
            };
            match change {
                Ok(change) => self.apply(&change),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Feed bridge lagged, reconciling");
                    self.reconcile();
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::debug!("Feed bridge stopped");
    }
}
