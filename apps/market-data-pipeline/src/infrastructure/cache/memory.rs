//! Process-local cache store with TTL expiry.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{decode_batches, encode_batch};
use crate::application::ports::{CacheError, CacheStore};
use crate::domain::cache::{CacheEntry, CacheKey, CacheStatus, NormalizedBatch};

#[derive(Debug)]
struct Slot {
    status: CacheStatus,
    last_timestamp: Option<String>,
    batches: Vec<String>,
    expires_at: Instant,
}

impl Slot {
    fn new(ttl: Duration) -> Self {
        Self {
            status: CacheStatus::Absent,
            last_timestamp: None,
            batches: Vec::new(),
            expires_at: Instant::now() + ttl,
        }
    }
}

/// In-memory [`CacheStore`].
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    slots: Mutex<HashMap<CacheKey, Slot>>,
}

impl InMemoryCacheStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` on a live slot, dropping it first if expired.
    fn with_live<T>(&self, key: &CacheKey, f: impl FnOnce(Option<&Slot>) -> T) -> T {
        let mut slots = self.slots.lock();
        if slots.get(key).is_some_and(|slot| slot.expires_at <= Instant::now()) {
            slots.remove(key);
        }
        f(slots.get(key))
    }

    fn with_slot_mut<T>(&self, key: &CacheKey, ttl: Duration, f: impl FnOnce(&mut Slot) -> T) -> T {
        let mut slots = self.slots.lock();
        let now = Instant::now();
        let slot = slots.entry(*key).or_insert_with(|| Slot::new(ttl));
        if slot.expires_at <= now {
            *slot = Slot::new(ttl);
        }
        slot.expires_at = now + ttl;
        f(slot)
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn status(&self, key: &CacheKey) -> Result<CacheStatus, CacheError> {
        Ok(self.with_live(key, |slot| slot.map_or(CacheStatus::Absent, |s| s.status)))
    }

    async fn set_status(
        &self,
        key: &CacheKey,
        status: CacheStatus,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.with_slot_mut(key, ttl, |slot| slot.status = status);
        Ok(())
    }

    async fn last_timestamp(&self, key: &CacheKey) -> Result<Option<String>, CacheError> {
        Ok(self.with_live(key, |slot| slot.and_then(|s| s.last_timestamp.clone())))
    }

    async fn batch_count(&self, key: &CacheKey) -> Result<usize, CacheError> {
        Ok(self.with_live(key, |slot| slot.map_or(0, |s| s.batches.len())))
    }

    async fn commit(
        &self,
        key: &CacheKey,
        batch: &NormalizedBatch,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let encoded = encode_batch(&batch.points)?;
        let last = batch.last_timestamp_string();
        self.with_slot_mut(key, ttl, |slot| {
            slot.batches.push(encoded);
            slot.last_timestamp = Some(last);
            slot.status = CacheStatus::Success;
        });
        Ok(())
    }

    async fn read(&self, key: &CacheKey) -> Result<CacheEntry, CacheError> {
        let snapshot = self.with_live(key, |slot| {
            slot.map(|s| (s.status, s.last_timestamp.clone(), s.batches.clone()))
        });
        let Some((status, last_timestamp, batches)) = snapshot else {
            return Ok(CacheEntry::absent());
        };
        Ok(CacheEntry {
            status,
            records: decode_batches(key, &batches)?,
            last_timestamp,
        })
    }
}
