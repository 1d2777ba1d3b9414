//! Feed Control Port (Driven Port)
//!
//! Commands accepted by the streaming connection. Implementations must
//! return immediately; the connection applies commands on its own task.

/// Port for steering the exchange feed.
pub trait FeedControl: Send + Sync {
    /// Subscribe a stream (e.g. `btcusdt@kline_1m`) on the live session,
    /// connecting first if the feed is idle.
    fn subscribe(&self, stream: String);

    /// Unsubscribe a stream. Closes the session once nothing is streamed.
    fn unsubscribe(&self, stream: String);

    /// Connect if the feed is not running.
    fn ensure_connected(&self);

    /// Whether the feed is running.
    fn is_running(&self) -> bool;
}
