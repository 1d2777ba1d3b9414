//! Application Ports (Driven)
//!
//! Interfaces for the external collaborators of the pipeline. Adapters live
//! under `infrastructure`; tests substitute in-memory versions.
//!
//! - [`TimeSeriesStore`]: tick write path and record read path
//! - [`CacheStore`]: status-tagged cache entries with a TTL
//! - [`EquitiesQuoteSource`], [`HistorySource`], [`CurrencyRateSource`]:
//!   remote price sources for the polled and backfilled asset classes
//! - [`FeedControl`]: commands to the streaming connection

mod cache_port;
mod feed_control_port;
mod source_port;
mod time_series_port;

pub use cache_port::{CacheError, CacheStore};
pub use feed_control_port::FeedControl;
pub use source_port::{
    CurrencyRate, CurrencyRateSource, EquitiesQuoteSource, HistorySource, SourceError,
};
pub use time_series_port::{TimeSeriesError, TimeSeriesStore};
