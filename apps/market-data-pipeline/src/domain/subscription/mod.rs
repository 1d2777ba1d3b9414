//! Subscription Registry
//!
//! The authoritative record of which users subscribe to which
//! `(asset, channel)` pairs.
//!
//! # Design
//!
//! Each row holds the asset, its channel, the set of subscribing users and a
//! removable flag. A row exists while it has at least one subscriber or is
//! pinned as non-removable (the base reporting currency). Outcomes tell the
//! caller when a row gained its first subscriber or lost its last one, which
//! is what drives upstream subscribe/unsubscribe commands.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::domain::asset::{Asset, AssetClass, AssetId, UserId};

// =============================================================================
// Types
// =============================================================================

/// Key of one subscription row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    /// Asset row id.
    pub asset_id: AssetId,
    /// Channel string, e.g. `kline_1m`.
    pub channel: String,
}

impl SubscriptionKey {
    /// Create a key.
    #[must_use]
    pub fn new(asset_id: AssetId, channel: impl Into<String>) -> Self {
        Self {
            asset_id,
            channel: channel.into(),
        }
    }
}

/// Result of a subscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// The user was added.
    Added {
        /// The row had no subscribers before this call.
        first_subscriber: bool,
    },
    /// The user was already subscribed. Nothing changed.
    AlreadySubscribed,
}

/// Result of an unsubscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    /// The user was removed.
    Removed {
        /// The row lost its last subscriber and was dropped.
        row_removed: bool,
    },
    /// The user was not subscribed. Nothing changed.
    NotSubscribed,
}

/// Read-only view of one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Subscribed asset.
    pub asset: Asset,
    /// Channel string.
    pub channel: String,
    /// Subscribing users.
    pub subscribers: HashSet<UserId>,
    /// Whether the row may be dropped once empty.
    pub removable: bool,
}

#[derive(Debug)]
struct SubscriptionRow {
    asset: Asset,
    subscribers: HashSet<UserId>,
    removable: bool,
}

impl SubscriptionRow {
    fn new(asset: Asset, removable: bool) -> Self {
        Self {
            asset,
            subscribers: HashSet::new(),
            removable,
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Thread-safe subscription registry.
///
/// # Example
///
/// ```rust
/// use market_data_pipeline::domain::asset::{Asset, DEFAULT_CHANNEL};
/// use market_data_pipeline::domain::subscription::{
///     SubscribeOutcome, SubscriptionRegistry, UnsubscribeOutcome,
/// };
///
/// let registry = SubscriptionRegistry::new();
/// let btc = Asset::crypto(1, "BTCUSDT");
///
/// let outcome = registry.subscribe(10, &btc, DEFAULT_CHANNEL);
/// assert_eq!(outcome, SubscribeOutcome::Added { first_subscriber: true });
///
/// // A second user shares the row
/// let outcome = registry.subscribe(11, &btc, DEFAULT_CHANNEL);
/// assert_eq!(outcome, SubscribeOutcome::Added { first_subscriber: false });
///
/// let outcome = registry.unsubscribe(10, btc.id(), DEFAULT_CHANNEL);
/// assert_eq!(outcome, UnsubscribeOutcome::Removed { row_removed: false });
///
/// let outcome = registry.unsubscribe(11, btc.id(), DEFAULT_CHANNEL);
/// assert_eq!(outcome, UnsubscribeOutcome::Removed { row_removed: true });
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    rows: RwLock<HashMap<SubscriptionKey, SubscriptionRow>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin a non-removable row for an asset.
    ///
    /// Returns `true` if the row was created by this call. An existing row is
    /// marked non-removable.
    pub fn pin(&self, asset: &Asset, channel: &str) -> bool {
        let mut rows = self.rows.write();
        let key = SubscriptionKey::new(asset.id(), channel);
        match rows.get_mut(&key) {
            Some(row) => {
                row.removable = false;
                false
            }
            None => {
                rows.insert(key, SubscriptionRow::new(asset.clone(), false));
                true
            }
        }
    }

    /// Add a user to the row for `(asset, channel)`, creating it if needed.
    pub fn subscribe(&self, user: UserId, asset: &Asset, channel: &str) -> SubscribeOutcome {
        let mut rows = self.rows.write();
        let row = rows
            .entry(SubscriptionKey::new(asset.id(), channel))
            .or_insert_with(|| SubscriptionRow::new(asset.clone(), true));

        let first_subscriber = row.subscribers.is_empty();
        if row.subscribers.insert(user) {
            SubscribeOutcome::Added { first_subscriber }
        } else {
            SubscribeOutcome::AlreadySubscribed
        }
    }

    /// Remove a user from the row for `(asset_id, channel)`.
    ///
    /// An emptied removable row is dropped. Pinned rows stay.
    pub fn unsubscribe(&self, user: UserId, asset_id: AssetId, channel: &str) -> UnsubscribeOutcome {
        let mut rows = self.rows.write();
        let key = SubscriptionKey::new(asset_id, channel);

        let Some(row) = rows.get_mut(&key) else {
            return UnsubscribeOutcome::NotSubscribed;
        };

        if !row.subscribers.remove(&user) {
            return UnsubscribeOutcome::NotSubscribed;
        }

        let row_removed = row.subscribers.is_empty() && row.removable;
        if row_removed {
            rows.remove(&key);
        }

        UnsubscribeOutcome::Removed { row_removed }
    }

    /// Get a snapshot of one row.
    #[must_use]
    pub fn get(&self, asset_id: AssetId, channel: &str) -> Option<Subscription> {
        let rows = self.rows.read();
        let key = SubscriptionKey::new(asset_id, channel);
        rows.get(&key).map(|row| Subscription {
            asset: row.asset.clone(),
            channel: key.channel.clone(),
            subscribers: row.subscribers.clone(),
            removable: row.removable,
        })
    }

    /// Whether the row for `(asset_id, channel)` exists and is pinned.
    #[must_use]
    pub fn is_pinned(&self, asset_id: AssetId, channel: &str) -> bool {
        self.rows
            .read()
            .get(&SubscriptionKey::new(asset_id, channel))
            .is_some_and(|row| !row.removable)
    }

    /// Check whether a user subscribes to a row.
    #[must_use]
    pub fn is_subscribed(&self, user: UserId, asset_id: AssetId, channel: &str) -> bool {
        self.rows
            .read()
            .get(&SubscriptionKey::new(asset_id, channel))
            .is_some_and(|row| row.subscribers.contains(&user))
    }

    /// All assets with a row, deduplicated across channels.
    #[must_use]
    pub fn assets(&self) -> Vec<Asset> {
        let rows = self.rows.read();
        let mut seen = HashSet::new();
        rows.values()
            .filter(|row| seen.insert(row.asset.id()))
            .map(|row| row.asset.clone())
            .collect()
    }

    /// Assets of one class that have at least one subscriber.
    #[must_use]
    pub fn subscribed_assets(&self, class: AssetClass) -> Vec<Asset> {
        let rows = self.rows.read();
        let mut seen = HashSet::new();
        rows.values()
            .filter(|row| row.asset.class() == class && !row.subscribers.is_empty())
            .filter(|row| seen.insert(row.asset.id()))
            .map(|row| row.asset.clone())
            .collect()
    }

    /// Exchange feed streams for every crypto row, sorted.
    #[must_use]
    pub fn feed_streams(&self) -> Vec<String> {
        let rows = self.rows.read();
        let mut streams: Vec<String> = rows
            .iter()
            .filter_map(|(key, row)| row.asset.feed_stream(&key.channel))
            .collect();
        streams.sort();
        streams.dedup();
        streams
    }

    /// Find the crypto asset whose trading pair matches a feed symbol.
    #[must_use]
    pub fn find_by_feed_symbol(&self, symbol: &str) -> Option<Asset> {
        self.rows
            .read()
            .values()
            .find(|row| {
                matches!(&row.asset, Asset::Crypto { trading_pair, .. }
                    if trading_pair.eq_ignore_ascii_case(symbol))
            })
            .map(|row| row.asset.clone())
    }

    /// Whether any crypto row exists, i.e. the feed should be running.
    #[must_use]
    pub fn has_streamed_assets(&self) -> bool {
        self.rows
            .read()
            .values()
            .any(|row| row.asset.class() == AssetClass::Crypto)
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        let rows = self.rows.read();
        let users: HashSet<UserId> = rows
            .values()
            .flat_map(|row| row.subscribers.iter().copied())
            .collect();
        SubscriptionStats {
            row_count: rows.len(),
            pinned_count: rows.values().filter(|row| !row.removable).count(),
            user_count: users.len(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Number of rows.
    pub row_count: usize,
    /// Number of non-removable rows.
    pub pinned_count: usize,
    /// Number of distinct subscribing users.
    pub user_count: usize,
}

// =============================================================================
// Tests
// =============================================================================
