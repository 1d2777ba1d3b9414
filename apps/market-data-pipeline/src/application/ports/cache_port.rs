//! Cache Store Port (Driven Port)
//!
//! Key-value store holding one hash and one list per [`CacheKey`]. Every
//! write refreshes the TTL of both keys.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::cache::{CacheEntry, CacheKey, CacheStatus, NormalizedBatch};

/// Cache store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// Store could not be reached.
    #[error("cache connection error: {message}")]
    Connection {
        /// Error details.
        message: String,
    },

    /// Stored payload could not be decoded.
    #[error("cache payload corrupt for {key}: {message}")]
    Corrupt {
        /// Offending key.
        key: String,
        /// Error details.
        message: String,
    },

    /// Batch could not be encoded.
    #[error("cache serialization error: {message}")]
    Serialization {
        /// Error details.
        message: String,
    },
}

/// Port for the status-tagged cache.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Current status of an entry, [`CacheStatus::Absent`] if missing.
    async fn status(&self, key: &CacheKey) -> Result<CacheStatus, CacheError>;

    /// Set the status (and kind) of an entry.
    async fn set_status(
        &self,
        key: &CacheKey,
        status: CacheStatus,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    /// Newest cached timestamp, as stored.
    async fn last_timestamp(&self, key: &CacheKey) -> Result<Option<String>, CacheError>;

    /// Number of cached batches.
    async fn batch_count(&self, key: &CacheKey) -> Result<usize, CacheError>;

    /// Append a batch, record its last timestamp and set status
    /// [`CacheStatus::Success`] in one atomic step.
    async fn commit(
        &self,
        key: &CacheKey,
        batch: &NormalizedBatch,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    /// Snapshot of an entry with all batches flattened.
    async fn read(&self, key: &CacheKey) -> Result<CacheEntry, CacheError>;
}
