//! Subscription Coordinator
//!
//! Owns the [`SubscriptionRegistry`] and announces when an asset gains its
//! first subscriber or loses its last one. Consumers (the feed bridge and the
//! backfill consumer) receive [`SubscriptionChange`]s over a broadcast
//! channel, so each sees every change in the order it was made.
//!
//! Each registry update and its change are made under one lock, so changes
//! arrive in registry order. A consumer that misses changes reconciles from
//! the registry.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::domain::asset::{Asset, AssetId, DEFAULT_CHANNEL, UserId};
use crate::domain::subscription::{SubscribeOutcome, SubscriptionRegistry, UnsubscribeOutcome};

/// Default capacity of the change channel.
pub const DEFAULT_CHANGE_CAPACITY: usize = 1024;

/// Direction of a subscription change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    /// The asset gained its first subscriber.
    Add,
    /// The asset lost its last subscriber.
    Remove,
}

/// Notification that an asset entered or left the subscribed set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionChange {
    /// Affected asset.
    pub asset: Asset,
    /// Channel of the affected row.
    pub channel: String,
    /// What happened.
    pub action: ChangeAction,
}

/// Coordinates user subscriptions and change notifications.
#[derive(Debug)]
pub struct SubscriptionCoordinator {
    registry: Arc<SubscriptionRegistry>,
    changes: broadcast::Sender<SubscriptionChange>,
    ordering: Mutex<()>,
}

impl SubscriptionCoordinator {
    /// Create a coordinator over a registry.
    #[must_use]
    pub fn new(registry: Arc<SubscriptionRegistry>, capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            registry,
            changes,
            ordering: Mutex::new(()),
        }
    }

    /// Shared registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Receive future changes.
    #[must_use]
    pub fn changes(&self) -> broadcast::Receiver<SubscriptionChange> {
        self.changes.subscribe()
    }

    /// Pin a non-removable row, e.g. the base reporting currency.
    ///
    /// Announces an `Add` when the row is new so consumers start tracking it.
    pub fn pin(&self, asset: &Asset) {
        let _ordering = self.ordering.lock();
        if self.registry.pin(asset, DEFAULT_CHANNEL) {
            tracing::info!(asset = %asset, "Pinned non-removable subscription");
            self.publish(asset, DEFAULT_CHANNEL, ChangeAction::Add);
        }
    }

    /// Subscribe a user to an asset on the default channel.
    pub fn subscribe(&self, user: UserId, asset: &Asset) -> SubscribeOutcome {
        self.subscribe_channel(user, asset, DEFAULT_CHANNEL)
    }

    /// Subscribe a user to an asset on a channel.
    ///
    /// A pinned row was announced when it was pinned, so its first user
    /// announces nothing.
    pub fn subscribe_channel(&self, user: UserId, asset: &Asset, channel: &str) -> SubscribeOutcome {
        let ordering = self.ordering.lock();
        let pinned = self.registry.is_pinned(asset.id(), channel);
        let outcome = self.registry.subscribe(user, asset, channel);
        match outcome {
            SubscribeOutcome::Added { first_subscriber } => {
                tracing::info!(user, asset = %asset, channel, first_subscriber, "User subscribed");
                if first_subscriber && !pinned {
                    self.publish(asset, channel, ChangeAction::Add);
                }
            }
            SubscribeOutcome::AlreadySubscribed => {
                tracing::debug!(user, asset = %asset, channel, "Already subscribed, ignoring");
            }
        }
        drop(ordering);
        self.record_gauge();
        outcome
    }

    /// Unsubscribe a user from an asset on the default channel.
    pub fn unsubscribe(&self, user: UserId, asset_id: AssetId) -> UnsubscribeOutcome {
        self.unsubscribe_channel(user, asset_id, DEFAULT_CHANNEL)
    }

    /// Unsubscribe a user from an asset on a channel.
    pub fn unsubscribe_channel(
        &self,
        user: UserId,
        asset_id: AssetId,
        channel: &str,
    ) -> UnsubscribeOutcome {
        let ordering = self.ordering.lock();
        // read before the write so a dropped row can still be announced
        let asset = self.registry.get(asset_id, channel).map(|row| row.asset);
        let outcome = self.registry.unsubscribe(user, asset_id, channel);

        match (outcome, asset) {
            (UnsubscribeOutcome::Removed { row_removed }, Some(asset)) => {
                tracing::info!(user, asset = %asset, channel, row_removed, "User unsubscribed");
                if row_removed {
                    self.publish(&asset, channel, ChangeAction::Remove);
                }
            }
            (UnsubscribeOutcome::Removed { .. }, None) | (UnsubscribeOutcome::NotSubscribed, _) => {
                tracing::debug!(user, asset_id, channel, "Not subscribed, ignoring");
            }
        }
        drop(ordering);
        self.record_gauge();
        outcome
    }

    fn publish(&self, asset: &Asset, channel: &str, action: ChangeAction) {
        let change = SubscriptionChange {
            asset: asset.clone(),
            channel: channel.to_string(),
            action,
        };
        // no receivers is fine: consumers reconcile from the registry on start
        if self.changes.send(change).is_err() {
            tracing::debug!(asset = %asset, ?action, "No change consumers attached");
        }
    }

    fn record_gauge(&self) {
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("subscriptions_active").set(self.registry.stats().row_count as f64);
    }
}
