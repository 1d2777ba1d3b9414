//! Configuration Module
//!
//! Typed pipeline configuration loaded from the environment and `.env` files.

mod settings;

pub use settings::{
    CacheBackend, CacheSettings, ConfigError, FeedSettings, PipelineConfig, RedisUrl,
    RetrySettings, SchedulerSettings, ServerSettings, SourceSettings, SubscriptionSettings,
    WorkerPoolSettings,
};
