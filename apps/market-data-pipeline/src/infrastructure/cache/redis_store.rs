//! Redis cache store.
//!
//! Multi-key updates go through `MULTI`/`EXEC` pipelines so a reader never
//! sees a batch without its `last_timestamp` or status.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use super::{decode_batches, encode_batch};
use crate::application::ports::{CacheError, CacheStore};
use crate::domain::cache::{
    CacheEntry, CacheKey, CacheStatus, LAST_TIMESTAMP_FIELD, NormalizedBatch, STATUS_FIELD,
    TYPE_FIELD,
};
use crate::infrastructure::config::RedisUrl;

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        Self::Connection {
            message: e.to_string(),
        }
    }
}

/// [`CacheStore`] backed by Redis.
#[derive(Clone)]
pub struct RedisCacheStore {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCacheStore").finish_non_exhaustive()
    }
}

impl RedisCacheStore {
    /// Connect to Redis. The connection manager reconnects on its own.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the first connect fails.
    pub async fn connect(url: &RedisUrl) -> Result<Self, CacheError> {
        tracing::info!(url = ?url, "Connecting to Redis");
        let client = redis::Client::open(url.expose())?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("Redis connection established");
        Ok(Self { conn })
    }

    /// Round-trip a `PING`.
    ///
    /// # Errors
    ///
    /// Returns an error if Redis does not answer.
    pub async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX)
}

fn parse_status(key: &CacheKey, raw: Option<String>) -> Result<CacheStatus, CacheError> {
    raw.map_or(Ok(CacheStatus::Absent), |s| {
        s.parse().map_err(|_| CacheError::Corrupt {
            key: key.hash_key(),
            message: format!("unknown status {s}"),
        })
    })
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn status(&self, key: &CacheKey) -> Result<CacheStatus, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(key.hash_key())
            .arg(STATUS_FIELD)
            .query_async(&mut conn)
            .await?;
        parse_status(key, raw)
    }

    async fn set_status(
        &self,
        key: &CacheKey,
        status: CacheStatus,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let hash = key.hash_key();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(&hash, STATUS_FIELD, status.as_str())
            .ignore()
            .hset(&hash, TYPE_FIELD, key.kind.as_str())
            .ignore()
            .expire(&hash, ttl_secs(ttl))
            .ignore()
            .expire(key.data_key(), ttl_secs(ttl))
            .ignore();

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn last_timestamp(&self, key: &CacheKey) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(key.hash_key())
            .arg(LAST_TIMESTAMP_FIELD)
            .query_async(&mut conn)
            .await?;
        Ok(raw)
    }

    async fn batch_count(&self, key: &CacheKey) -> Result<usize, CacheError> {
        let mut conn = self.conn.clone();
        let len: usize = redis::cmd("LLEN")
            .arg(key.data_key())
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn commit(
        &self,
        key: &CacheKey,
        batch: &NormalizedBatch,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let encoded = encode_batch(&batch.points)?;
        let hash = key.hash_key();
        let data = key.data_key();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .rpush(&data, encoded)
            .ignore()
            .hset(&hash, LAST_TIMESTAMP_FIELD, batch.last_timestamp_string())
            .ignore()
            .hset(&hash, STATUS_FIELD, CacheStatus::Success.as_str())
            .ignore()
            .hset(&hash, TYPE_FIELD, key.kind.as_str())
            .ignore()
            .expire(&hash, ttl_secs(ttl))
            .ignore()
            .expire(&data, ttl_secs(ttl))
            .ignore();

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        tracing::debug!(key = %key, points = batch.points.len(), "Committed cache batch");
        Ok(())
    }

    async fn read(&self, key: &CacheKey) -> Result<CacheEntry, CacheError> {
        let hash = key.hash_key();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hget(&hash, STATUS_FIELD)
            .hget(&hash, LAST_TIMESTAMP_FIELD)
            .lrange(key.data_key(), 0, -1);

        let mut conn = self.conn.clone();
        let (status, last_timestamp, batches): (Option<String>, Option<String>, Vec<String>) =
            pipe.query_async(&mut conn).await?;

        let status = parse_status(key, status)?;
        if status == CacheStatus::Absent {
            return Ok(CacheEntry::absent());
        }
        Ok(CacheEntry {
            status,
            records: decode_batches(key, &batches)?,
            last_timestamp,
        })
    }
}
