//! Cache Store Adapters
//!
//! Both adapters use the same layout: a hash `kline_{kind}_{id}` holding
//! `status`, `last_timestamp` and `type`, and a list `kline_{kind}_{id}:data`
//! where each element is one JSON-encoded batch of points.

mod memory;
mod redis_store;

pub use memory::InMemoryCacheStore;
pub use redis_store::RedisCacheStore;

use crate::application::ports::CacheError;
use crate::domain::cache::{CacheKey, KlinePoint};

fn encode_batch(points: &[KlinePoint]) -> Result<String, CacheError> {
    serde_json::to_string(points).map_err(|e| CacheError::Serialization {
        message: e.to_string(),
    })
}

fn decode_batches(key: &CacheKey, raw: &[String]) -> Result<Vec<KlinePoint>, CacheError> {
    let mut points = Vec::new();
    for batch in raw {
        let decoded: Vec<KlinePoint> =
            serde_json::from_str(batch).map_err(|e| CacheError::Corrupt {
                key: key.data_key(),
                message: e.to_string(),
            })?;
        points.extend(decoded);
    }
    Ok(points)
}
