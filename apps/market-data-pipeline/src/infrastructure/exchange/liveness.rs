//! Connection Liveness
//!
//! The exchange drops sessions after a day, so connections are rotated
//! before that happens. The monitor checks the age of the current connection
//! on a coarse interval and asks the connection manager to rotate once it
//! passes the configured lifetime.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Connection age bookkeeping shared with the connection manager.
#[derive(Debug, Default)]
pub struct ConnectionClock {
    connected_at: RwLock<Option<Instant>>,
    rotation_requested: AtomicBool,
}

impl ConnectionClock {
    /// Create a clock with no connection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start timing a new connection.
    pub fn mark_connected(&self) {
        *self.connected_at.write() = Some(Instant::now());
        self.rotation_requested.store(false, Ordering::SeqCst);
    }

    /// Stop timing.
    pub fn mark_disconnected(&self) {
        *self.connected_at.write() = None;
        self.rotation_requested.store(false, Ordering::SeqCst);
    }

    /// Age of the current connection, if any.
    #[must_use]
    pub fn age(&self) -> Option<Duration> {
        self.connected_at.read().map(|at| at.elapsed())
    }

    /// Record that rotation was requested. Returns `false` if it already was.
    fn request_rotation(&self) -> bool {
        !self.rotation_requested.swap(true, Ordering::SeqCst)
    }
}

/// Rotation request sent to the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationDue {
    /// Connection age when the check fired.
    pub age: Duration,
}

/// Periodic connection-age check.
pub struct LivenessMonitor {
    interval: Duration,
    max_lifetime: Duration,
    clock: Arc<ConnectionClock>,
    rotate_tx: mpsc::Sender<RotationDue>,
    cancel: CancellationToken,
}

impl LivenessMonitor {
    /// Create a monitor.
    #[must_use]
    pub const fn new(
        interval: Duration,
        max_lifetime: Duration,
        clock: Arc<ConnectionClock>,
        rotate_tx: mpsc::Sender<RotationDue>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            interval,
            max_lifetime,
            clock,
            rotate_tx,
            cancel,
        }
    }

    /// Run until cancelled or the receiver is dropped.
    pub async fn run(self) {
        let start = Instant::now() + self.interval;
        let mut interval = tokio::time::interval_at(start, self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Liveness monitor cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if !self.check().await {
                        break;
                    }
                }
            }
        }
    }

    /// Returns `false` when the manager has gone away.
    async fn check(&self) -> bool {
        let Some(age) = self.clock.age() else {
            return true;
        };
        if age < self.max_lifetime || !self.clock.request_rotation() {
            return true;
        }

        tracing::info!(
            age_secs = age.as_secs(),
            max_lifetime_secs = self.max_lifetime.as_secs(),
            "Connection reached max lifetime, requesting rotation"
        );
        self.rotate_tx.send(RotationDue { age }).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_monitor(
        clock: &Arc<ConnectionClock>,
    ) -> (mpsc::Receiver<RotationDue>, CancellationToken) {
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let monitor = LivenessMonitor::new(
            Duration::from_secs(3600),
            Duration::from_secs(24 * 3600),
            Arc::clone(clock),
            tx,
            cancel.clone(),
        );
        tokio::spawn(monitor.run());
        (rx, cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn requests_rotation_once_after_lifetime() {
        let clock = Arc::new(ConnectionClock::new());
        clock.mark_connected();
        let (mut rx, cancel) = spawn_monitor(&clock);

        tokio::time::sleep(Duration::from_secs(23 * 3600 + 60)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(3600)).await;
        let due = rx.try_recv().unwrap();
        assert!(due.age >= Duration::from_secs(24 * 3600));

        // no repeat until the connection is replaced
        tokio::time::sleep(Duration::from_secs(3 * 3600)).await;
        assert!(rx.try_recv().is_err());

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_when_disconnected() {
        let clock = Arc::new(ConnectionClock::new());
        let (mut rx, cancel) = spawn_monitor(&clock);

        tokio::time::sleep(Duration::from_secs(48 * 3600)).await;
        assert!(rx.try_recv().is_err());
        cancel.cancel();
    }

    #[test]
    fn reconnect_rearms_rotation() {
        let clock = ConnectionClock::new();
        clock.mark_connected();
        assert!(clock.request_rotation());
        assert!(!clock.request_rotation());

        clock.mark_connected();
        assert!(clock.request_rotation());

        clock.mark_disconnected();
        assert_eq!(clock.age(), None);
    }
}
