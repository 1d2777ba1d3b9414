//! Stream Connection Manager
//!
//! Owns the single streaming session to the exchange. All state changes
//! happen on one event-loop task; callers steer it through a [`FeedHandle`]
//! and read a shared [`ConnectionStatus`].
//!
//! # State machine
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//! Connected --close/rotation--> Closed -> Reconnecting --fixed delay--> Connecting
//! Connecting/Connected --error--> Reconnecting --backoff--> Connecting
//!                                 (attempts spent) -> Error, running = false
//! any --last stream removed--> Disconnected
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::backoff::Backoff;
use super::codec::{FeedCodec, FeedCommand, InboundFrame};
use super::liveness::{ConnectionClock, LivenessMonitor, RotationDue};
use super::transport::{FeedConnector, FeedEvent, FeedSession};
use crate::application::ports::FeedControl;
use crate::domain::market_data::Tick;
use crate::domain::subscription::SubscriptionRegistry;
use crate::infrastructure::config::FeedSettings;

// =============================================================================
// Status
// =============================================================================

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No session and nothing to stream.
    Disconnected,
    /// Opening a session.
    Connecting,
    /// Session open and subscribed.
    Connected,
    /// Reconnect attempts ran out.
    Error,
    /// Session ended; a reconnect follows if anything is streamed.
    Closed,
    /// Waiting to reconnect.
    Reconnecting,
}

/// Point-in-time view of the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    /// Current state.
    pub state: ConnectionState,
    /// Whether the manager is trying to keep a session open.
    pub running: bool,
    /// Transport-error reconnect attempts since the last clean connect.
    pub retry_count: u32,
    /// When the current session opened.
    pub connected_at: Option<DateTime<Utc>>,
    /// Last transport error.
    pub last_error: Option<String>,
}

/// Shared, lock-protected connection status.
#[derive(Debug)]
pub struct ConnectionStatus {
    inner: RwLock<ConnectionSnapshot>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            inner: RwLock::new(ConnectionSnapshot {
                state: ConnectionState::Disconnected,
                running: false,
                retry_count: 0,
                connected_at: None,
                last_error: None,
            }),
        }
    }
}

impl ConnectionStatus {
    /// Copy of the current status.
    #[must_use]
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.inner.read().clone()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.read().state
    }

    fn update(&self, f: impl FnOnce(&mut ConnectionSnapshot)) {
        let mut inner = self.inner.write();
        f(&mut inner);
        tracing::debug!(state = ?inner.state, running = inner.running, "Feed status updated");
    }
}

// =============================================================================
// Handle
// =============================================================================

#[derive(Debug)]
enum Command {
    Subscribe(String),
    Unsubscribe(String),
    EnsureConnected,
    Shutdown,
}

/// Cloneable handle to a running [`StreamConnectionManager`].
#[derive(Debug, Clone)]
pub struct FeedHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: Arc<ConnectionStatus>,
}

impl FeedHandle {
    /// Shared status.
    #[must_use]
    pub const fn status(&self) -> &Arc<ConnectionStatus> {
        &self.status
    }

    /// Close the session and stop the event loop.
    pub fn close(&self) {
        self.send(Command::Shutdown);
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("Feed event loop has exited, command ignored");
        }
    }
}

impl FeedControl for FeedHandle {
    fn subscribe(&self, stream: String) {
        self.send(Command::Subscribe(stream));
    }

    fn unsubscribe(&self, stream: String) {
        self.send(Command::Unsubscribe(stream));
    }

    fn ensure_connected(&self) {
        self.send(Command::EnsureConnected);
    }

    fn is_running(&self) -> bool {
        self.status.snapshot().running
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Streaming connection manager.
pub struct StreamConnectionManager {
    settings: FeedSettings,
    connector: Arc<dyn FeedConnector>,
    registry: Arc<SubscriptionRegistry>,
    tick_tx: mpsc::Sender<Tick>,
    status: Arc<ConnectionStatus>,
    clock: Arc<ConnectionClock>,
    codec: FeedCodec,
    backoff: Backoff,
    commands: mpsc::UnboundedReceiver<Command>,
    session: Option<FeedSession>,
    reconnect_at: Option<Instant>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for StreamConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnectionManager")
            .field("url", &self.settings.url)
            .field("status", &self.status.snapshot())
            .finish_non_exhaustive()
    }
}

impl StreamConnectionManager {
    /// Create a manager and its handle. Nothing connects until [`run`] is
    /// spawned and a stream is subscribed.
    ///
    /// [`run`]: Self::run
    #[must_use]
    pub fn new(
        settings: FeedSettings,
        connector: Arc<dyn FeedConnector>,
        registry: Arc<SubscriptionRegistry>,
        tick_tx: mpsc::Sender<Tick>,
        cancel: CancellationToken,
    ) -> (Self, FeedHandle) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let status = Arc::new(ConnectionStatus::default());
        let backoff = Backoff::from_feed_settings(&settings);

        let manager = Self {
            settings,
            connector,
            registry,
            tick_tx,
            status: Arc::clone(&status),
            clock: Arc::new(ConnectionClock::new()),
            codec: FeedCodec::new(),
            backoff,
            commands: commands_rx,
            session: None,
            reconnect_at: None,
            cancel,
        };
        let handle = FeedHandle {
            commands: commands_tx,
            status,
        };
        (manager, handle)
    }

    /// Run the event loop until cancelled or closed through the handle.
    pub async fn run(mut self) {
        let (rotate_tx, mut rotate_rx) = mpsc::channel::<RotationDue>(1);
        let liveness_cancel = self.cancel.child_token();
        tokio::spawn(
            LivenessMonitor::new(
                self.settings.liveness_interval,
                self.settings.max_connection_lifetime,
                Arc::clone(&self.clock),
                rotate_tx,
                liveness_cancel.clone(),
            )
            .run(),
        );

        if self.registry.has_streamed_assets() {
            self.connect().await;
        }

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::info!("Feed connection manager cancelled");
                    break;
                }
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }
                event = next_event(&mut self.session) => {
                    self.handle_event(event).await;
                }
                () = wait_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.connect().await;
                }
                Some(due) = rotate_rx.recv() => {
                    tracing::info!(age_secs = due.age.as_secs(), "Rotating feed connection");
                    self.close_session().await;
                    self.on_disconnect("max lifetime reached");
                }
            }
        }

        liveness_cancel.cancel();
        self.close_session().await;
        self.reconnect_at = None;
        self.status.update(|s| {
            s.state = ConnectionState::Closed;
            s.running = false;
            s.connected_at = None;
        });
        tracing::info!("Feed connection manager stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe(stream) => {
                if self.session.is_some() {
                    self.send_command(FeedCommand::subscribe([stream])).await;
                } else if self.reconnect_at.is_none() {
                    // connect() subscribes everything in the registry
                    self.backoff.reset();
                    self.connect().await;
                }
            }
            Command::Unsubscribe(stream) => {
                if self.session.is_some() {
                    self.send_command(FeedCommand::unsubscribe([stream])).await;
                }
                if !self.registry.has_streamed_assets() {
                    self.go_idle().await;
                }
            }
            Command::EnsureConnected => {
                let idle = self.session.is_none() && self.reconnect_at.is_none();
                if idle && self.registry.has_streamed_assets() {
                    tracing::info!("Feed not running, restarting");
                    self.backoff.reset();
                    self.connect().await;
                }
            }
            Command::Shutdown => {}
        }
    }

    async fn handle_event(&mut self, event: Option<FeedEvent>) {
        match event {
            Some(FeedEvent::Text(text)) => self.handle_text(&text),
            Some(FeedEvent::Closed(reason)) => {
                self.session = None;
                self.on_disconnect(&reason);
            }
            Some(FeedEvent::Error(message)) => {
                self.session = None;
                self.on_transport_error(message);
            }
            None => {
                self.session = None;
                self.on_disconnect("session ended");
            }
        }
    }

    fn handle_text(&self, text: &str) {
        match self.codec.decode(text) {
            Ok(InboundFrame::Tick(tick)) => {
                metrics::counter!("feed_ticks_received_total").increment(1);
                if let Err(e) = self.tick_tx.try_send(tick) {
                    metrics::counter!("feed_frames_dropped_total", "reason" => "backpressure")
                        .increment(1);
                    tracing::warn!(error = %e, "Tick channel full, dropping tick");
                }
            }
            Ok(InboundFrame::Ack { id }) => {
                tracing::debug!(?id, "Feed command acknowledged");
            }
            Ok(InboundFrame::Unrecognized) => {
                tracing::debug!(len = text.len(), "Unrecognized feed frame");
            }
            Err(e) => {
                metrics::counter!("feed_frames_dropped_total", "reason" => "protocol").increment(1);
                tracing::warn!(error = %e, "Malformed feed frame, dropping");
            }
        }
    }

    async fn connect(&mut self) {
        if !self.registry.has_streamed_assets() {
            self.status.update(|s| {
                s.state = ConnectionState::Disconnected;
                s.running = false;
            });
            return;
        }

        self.status.update(|s| {
            s.state = ConnectionState::Connecting;
            s.running = true;
        });

        match self.connector.connect(&self.settings.url).await {
            Ok(session) => {
                self.session = Some(session);
                let streams = self.registry.feed_streams();
                let count = streams.len();
                if !self.send_command(FeedCommand::subscribe(streams)).await {
                    return;
                }

                self.backoff.reset();
                self.clock.mark_connected();
                self.status.update(|s| {
                    s.state = ConnectionState::Connected;
                    s.retry_count = 0;
                    s.connected_at = Some(Utc::now());
                });
                metrics::counter!("feed_connects_total").increment(1);
                tracing::info!(streams = count, "Feed connected and subscribed");
            }
            Err(e) => self.on_transport_error(e.to_string()),
        }
    }

    /// Encode and send a command. Returns `false` if the session broke.
    async fn send_command(&mut self, command: FeedCommand) -> bool {
        if command.is_empty() {
            return true;
        }
        let Some(session) = &self.session else {
            return false;
        };
        let text = match self.codec.encode(&command) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode feed command");
                return true;
            }
        };
        tracing::debug!(method = ?command.method, streams = ?command.params, "Sending feed command");
        let sent = session.send_text(text).await;
        if let Err(e) = sent {
            self.session = None;
            self.on_transport_error(e.to_string());
            return false;
        }
        true
    }

    /// Clean close or rotation: reconnect after the fixed delay.
    fn on_disconnect(&mut self, reason: &str) {
        self.clock.mark_disconnected();
        self.status.update(|s| {
            s.state = ConnectionState::Closed;
            s.connected_at = None;
        });

        if !self.registry.has_streamed_assets() {
            tracing::info!(reason, "Feed closed with nothing to stream");
            self.status.update(|s| {
                s.state = ConnectionState::Disconnected;
                s.running = false;
            });
            return;
        }

        let delay = self.settings.disconnect_reconnect_delay;
        tracing::info!(reason, delay_ms = delay.as_millis(), "Feed closed, scheduling reconnect");
        metrics::counter!("feed_reconnects_total", "reason" => "disconnect").increment(1);
        self.backoff.reset();
        self.reconnect_at = Some(Instant::now() + delay);
        self.status.update(|s| {
            s.state = ConnectionState::Reconnecting;
            s.retry_count = 0;
        });
    }

    /// Transport failure: back off, or give up once attempts are spent.
    fn on_transport_error(&mut self, message: String) {
        self.clock.mark_disconnected();

        if let Some(delay) = self.backoff.next_delay() {
            let attempt = self.backoff.attempts();
            tracing::warn!(
                error = %message,
                attempt,
                delay_ms = delay.as_millis(),
                "Feed transport error, reconnecting with backoff"
            );
            metrics::counter!("feed_reconnects_total", "reason" => "error").increment(1);
            self.reconnect_at = Some(Instant::now() + delay);
            self.status.update(|s| {
                s.state = ConnectionState::Reconnecting;
                s.retry_count = attempt;
                s.connected_at = None;
                s.last_error = Some(message);
            });
        } else {
            tracing::error!(
                error = %message,
                attempts = self.backoff.attempts(),
                "Feed reconnect attempts exhausted"
            );
            self.reconnect_at = None;
            self.status.update(|s| {
                s.state = ConnectionState::Error;
                s.running = false;
                s.connected_at = None;
                s.last_error = Some(message);
            });
        }
    }

    /// Nothing left to stream: close and stay down.
    async fn go_idle(&mut self) {
        self.reconnect_at = None;
        self.close_session().await;
        self.clock.mark_disconnected();
        self.status.update(|s| {
            s.state = ConnectionState::Disconnected;
            s.running = false;
            s.connected_at = None;
        });
        tracing::info!("Last streamed asset removed, feed closed");
    }

    async fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }
}

async fn next_event(session: &mut Option<FeedSession>) -> Option<FeedEvent> {
    match session {
        Some(session) => session.inbound.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::domain::asset::{Asset, DEFAULT_CHANNEL};
    use crate::infrastructure::exchange::transport::{FeedError, OutboundFrame};

    /// Server side of a fake session.
    struct Remote {
        sent: mpsc::Receiver<OutboundFrame>,
        events: mpsc::Sender<FeedEvent>,
    }

    #[derive(Default)]
    struct FakeConnector {
        failures: Mutex<VecDeque<String>>,
        remotes: Mutex<VecDeque<Remote>>,
        attempts: Mutex<u32>,
    }

    impl FakeConnector {
        fn fail_next(&self, n: usize) {
            let mut failures = self.failures.lock();
            for i in 0..n {
                failures.push_back(format!("refused {i}"));
            }
        }

        fn take_remote(&self) -> Remote {
            self.remotes.lock().pop_front().unwrap()
        }
    }

    #[async_trait]
    impl FeedConnector for FakeConnector {
        async fn connect(&self, _url: &str) -> Result<FeedSession, FeedError> {
            *self.attempts.lock() += 1;
            if let Some(reason) = self.failures.lock().pop_front() {
                return Err(FeedError::Connect(reason));
            }
            let (out_tx, out_rx) = mpsc::channel(16);
            let (in_tx, in_rx) = mpsc::channel(16);
            self.remotes.lock().push_back(Remote {
                sent: out_rx,
                events: in_tx,
            });
            Ok(FeedSession {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
    }

    fn settings() -> FeedSettings {
        FeedSettings {
            reconnect_jitter: 0.0,
            ..FeedSettings::default()
        }
    }

    struct Harness {
        connector: Arc<FakeConnector>,
        registry: Arc<SubscriptionRegistry>,
        handle: FeedHandle,
        ticks: mpsc::Receiver<Tick>,
        cancel: CancellationToken,
    }

    fn start() -> Harness {
        let connector = Arc::new(FakeConnector::default());
        let registry = Arc::new(SubscriptionRegistry::new());
        let (tick_tx, ticks) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let (manager, handle) = StreamConnectionManager::new(
            settings(),
            Arc::clone(&connector) as Arc<dyn FeedConnector>,
            Arc::clone(&registry),
            tick_tx,
            cancel.clone(),
        );
        tokio::spawn(manager.run());
        Harness {
            connector,
            registry,
            handle,
            ticks,
            cancel,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn subscribe(h: &Harness, id: u64, pair: &str) -> String {
        let asset = Asset::crypto(id, pair);
        h.registry.subscribe(1, &asset, DEFAULT_CHANNEL);
        let stream = asset.feed_stream(DEFAULT_CHANNEL).unwrap();
        h.handle.subscribe(stream.clone());
        stream
    }

    #[tokio::test(start_paused = true)]
    async fn first_subscribe_connects_and_forwards_ticks() {
        let mut h = start();
        subscribe(&h, 1, "BTCUSDT");
        settle().await;

        let mut remote = h.connector.take_remote();
        assert_eq!(
            remote.sent.try_recv().unwrap(),
            OutboundFrame::Text(
                r#"{"method":"SUBSCRIBE","params":["btcusdt@kline_1m"],"id":null}"#.to_string()
            )
        );
        assert_eq!(h.handle.status().state(), ConnectionState::Connected);
        assert!(h.handle.is_running());

        remote
            .events
            .send(FeedEvent::Text(
                r#"{"data":{"k":{"t":1700000000000,"s":"BTCUSDT","o":"1","h":"2","l":"0.5","c":"1.5","v":"10"}}}"#
                    .to_string(),
            ))
            .await
            .unwrap();
        remote
            .events
            .send(FeedEvent::Text("{not json".to_string()))
            .await
            .unwrap();
        settle().await;

        let tick = h.ticks.try_recv().unwrap();
        assert_eq!(tick.symbol, "BTCUSDT");
        assert!(h.ticks.try_recv().is_err());
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn clean_close_reconnects_after_fixed_delay_and_resubscribes() {
        let h = start();
        subscribe(&h, 1, "BTCUSDT");
        settle().await;
        let remote = h.connector.take_remote();
        subscribe(&h, 2, "ETHUSDT");
        settle().await;

        remote
            .events
            .send(FeedEvent::Closed("1000 normal".to_string()))
            .await
            .unwrap();
        settle().await;
        assert_eq!(h.handle.status().state(), ConnectionState::Reconnecting);

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(*h.connector.attempts.lock(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let mut second = h.connector.take_remote();
        assert_eq!(
            second.sent.try_recv().unwrap(),
            OutboundFrame::Text(
                r#"{"method":"SUBSCRIBE","params":["btcusdt@kline_1m","ethusdt@kline_1m"],"id":null}"#
                    .to_string()
            )
        );
        let snapshot = h.handle.status().snapshot();
        assert_eq!(snapshot.state, ConnectionState::Connected);
        assert_eq!(snapshot.retry_count, 0);
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failures_back_off_then_give_up() {
        let h = start();
        h.connector.fail_next(4);
        subscribe(&h, 1, "BTCUSDT");
        settle().await;

        let snapshot = h.handle.status().snapshot();
        assert_eq!(snapshot.state, ConnectionState::Reconnecting);
        assert_eq!(snapshot.retry_count, 1);
        assert_eq!(snapshot.last_error.as_deref(), Some("feed connection failed: refused 0"));

        // 1s + 2s + 4s backoff, then the budget of three is spent
        tokio::time::sleep(Duration::from_secs(10)).await;

        let snapshot = h.handle.status().snapshot();
        assert_eq!(snapshot.state, ConnectionState::Error);
        assert!(!snapshot.running);
        assert_eq!(*h.connector.attempts.lock(), 4);

        // the health job can restart it
        h.handle.ensure_connected();
        settle().await;
        assert_eq!(h.handle.status().state(), ConnectionState::Connected);
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn removing_last_stream_closes_without_reconnect() {
        let h = start();
        let stream = subscribe(&h, 1, "BTCUSDT");
        settle().await;
        let mut remote = h.connector.take_remote();
        let _ = remote.sent.try_recv();

        h.registry.unsubscribe(1, 1, DEFAULT_CHANNEL);
        h.handle.unsubscribe(stream);
        settle().await;

        assert!(matches!(remote.sent.try_recv().unwrap(), OutboundFrame::Text(t) if t.contains("UNSUBSCRIBE")));
        assert_eq!(remote.sent.try_recv().unwrap(), OutboundFrame::Close);
        assert_eq!(h.handle.status().state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(*h.connector.attempts.lock(), 1);
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn rotates_connection_after_max_lifetime() {
        let h = start();
        subscribe(&h, 1, "BTCUSDT");
        settle().await;
        let mut first = h.connector.take_remote();
        let _ = first.sent.try_recv();

        tokio::time::sleep(Duration::from_secs(24 * 3600 + 5)).await;
        assert_eq!(first.sent.try_recv().unwrap(), OutboundFrame::Close);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(*h.connector.attempts.lock(), 2);
        assert_eq!(h.handle.status().state(), ConnectionState::Connected);
        h.cancel.cancel();
    }
}
