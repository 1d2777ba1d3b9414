//! Subscription Flow Integration Tests
//!
//! Drives user subscriptions through the coordinator, feed bridge and
//! connection manager against a scripted exchange, and checks that feed
//! ticks land in the time-series store.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use market_data_pipeline::application::ports::{
    EquitiesQuoteSource, FeedControl, SourceError, TimeSeriesStore,
};
use market_data_pipeline::application::services::bridge::FeedBridge;
use market_data_pipeline::application::services::equities::EquitiesPoller;
use market_data_pipeline::application::services::ingest::TickIngestor;
use market_data_pipeline::application::services::market_hours::MarketHours;
use market_data_pipeline::infrastructure::config::FeedSettings;
use market_data_pipeline::infrastructure::exchange::{
    ConnectionState, FeedConnector, FeedError, FeedEvent, FeedHandle, FeedSession, OutboundFrame,
    StreamConnectionManager,
};
use market_data_pipeline::infrastructure::timeseries::InMemoryTimeSeriesStore;
use market_data_pipeline::{
    Asset, QueryKind, SubscriptionCoordinator, SubscriptionRegistry, Tick, TwMarket,
    UnsubscribeOutcome,
};

// =============================================================================
// Scripted exchange
// =============================================================================

struct Remote {
    sent: mpsc::Receiver<OutboundFrame>,
    events: mpsc::Sender<FeedEvent>,
}

impl Remote {
    fn drain(&mut self) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.sent.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

#[derive(Default)]
struct ScriptedExchange {
    remotes: Mutex<VecDeque<Remote>>,
    connects: Mutex<u32>,
}

impl ScriptedExchange {
    fn next_remote(&self) -> Remote {
        self.remotes.lock().pop_front().expect("no session opened")
    }

    fn connects(&self) -> u32 {
        *self.connects.lock()
    }
}

#[async_trait]
impl FeedConnector for ScriptedExchange {
    async fn connect(&self, _url: &str) -> Result<FeedSession, FeedError> {
        *self.connects.lock() += 1;
        let (out_tx, out_rx) = mpsc::channel(32);
        let (in_tx, in_rx) = mpsc::channel(32);
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

struct NoQuotes;

#[async_trait]
impl EquitiesQuoteSource for NoQuotes {
    async fn fetch_quotes(&self, _stocks: &[Asset]) -> Result<Vec<Tick>, SourceError> {
        Ok(Vec::new())
    }

    async fn is_listed(&self, _stock: &Asset) -> Result<bool, SourceError> {
        Ok(true)
    }
}

// =============================================================================
// Pipeline under test
// =============================================================================

struct Pipeline {
    exchange: Arc<ScriptedExchange>,
    registry: Arc<SubscriptionRegistry>,
    coordinator: SubscriptionCoordinator,
    poller: Arc<EquitiesPoller>,
    store: Arc<InMemoryTimeSeriesStore>,
    feed: FeedHandle,
    cancel: CancellationToken,
}

fn start() -> Pipeline {
    let exchange = Arc::new(ScriptedExchange::default());
    let registry = Arc::new(SubscriptionRegistry::new());
    let store = Arc::new(InMemoryTimeSeriesStore::new());
    let cancel = CancellationToken::new();

    let (tick_tx, tick_rx) = mpsc::channel(64);
    let settings = FeedSettings {
        reconnect_jitter: 0.0,
        ..FeedSettings::default()
    };
    let (manager, feed) = StreamConnectionManager::new(
        settings,
        Arc::clone(&exchange) as Arc<dyn FeedConnector>,
        Arc::clone(&registry),
        tick_tx,
        cancel.clone(),
    );
    tokio::spawn(manager.run());

    let ingestor = Arc::new(TickIngestor::new(
        Arc::clone(&store) as Arc<dyn TimeSeriesStore>,
        Arc::clone(&registry),
        3,
    ));
    tokio::spawn(ingestor.run(tick_rx, cancel.clone()));

    let poller = Arc::new(EquitiesPoller::new(
        Arc::clone(&registry),
        Arc::new(NoQuotes),
        Arc::clone(&store) as Arc<dyn TimeSeriesStore>,
        MarketHours::default(),
        3,
        true,
    ));

    let coordinator = SubscriptionCoordinator::new(Arc::clone(&registry), 64);
    let bridge = Arc::new(FeedBridge::new(
        Arc::new(feed.clone()) as Arc<dyn FeedControl>,
        Arc::clone(&poller),
        Arc::clone(&registry),
    ));
    tokio::spawn(bridge.run(coordinator.changes(), cancel.clone()));

    Pipeline {
        exchange,
        registry,
        coordinator,
        poller,
        store,
        feed,
        cancel,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

fn subscribe_frame(streams: &[String]) -> OutboundFrame {
    let params = streams
        .iter()
        .map(|s| format!("\"{s}\""))
        .collect::<Vec<_>>()
        .join(",");
    OutboundFrame::Text(format!(r#"{{"method":"SUBSCRIBE","params":[{params}],"id":null}}"#))
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn shared_pair_opens_one_stream_and_closes_after_last_user() {
    let p = start();
    let btc = Asset::crypto(10, "BTCUSDT");

    p.coordinator.subscribe(1, &btc);
    settle().await;
    p.coordinator.subscribe(2, &btc);
    settle().await;

    let mut remote = p.exchange.next_remote();
    assert_eq!(p.exchange.connects(), 1);
    assert_eq!(
        remote.drain(),
        vec![subscribe_frame(&["btcusdt@kline_1m".to_string()])]
    );

    // first user leaves: the second still needs the stream
    assert_eq!(
        p.coordinator.unsubscribe(1, 10),
        UnsubscribeOutcome::Removed { row_removed: false }
    );
    settle().await;
    assert!(remote.drain().is_empty());
    assert_eq!(p.feed.status().state(), ConnectionState::Connected);

    // last user leaves: unsubscribe, then close without reconnecting
    p.coordinator.unsubscribe(2, 10);
    settle().await;
    let frames = remote.drain();
    assert_eq!(frames.len(), 2);
    assert!(matches!(&frames[0], OutboundFrame::Text(t) if t.contains("UNSUBSCRIBE")));
    assert_eq!(frames[1], OutboundFrame::Close);
    assert_eq!(p.feed.status().state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(p.exchange.connects(), 1);
    p.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn reconnect_resubscribes_exactly_the_registry() {
    let p = start();
    p.coordinator.subscribe(1, &Asset::crypto(10, "BTCUSDT"));
    settle().await;
    p.coordinator.subscribe(2, &Asset::crypto(11, "ETHUSDT"));
    p.coordinator.subscribe(3, &Asset::crypto(12, "SOLUSDT"));
    settle().await;
    p.coordinator.unsubscribe(3, 12);
    settle().await;

    let remote = p.exchange.next_remote();
    remote
        .events
        .send(FeedEvent::Closed("1001 going away".to_string()))
        .await
        .unwrap();
    settle().await;
    assert_eq!(p.feed.status().state(), ConnectionState::Reconnecting);

    tokio::time::sleep(Duration::from_secs(11)).await;
    let mut second = p.exchange.next_remote();
    let expected = p.registry.feed_streams();
    assert_eq!(
        expected,
        vec!["btcusdt@kline_1m".to_string(), "ethusdt@kline_1m".to_string()]
    );
    assert_eq!(second.drain(), vec![subscribe_frame(&expected)]);
    assert_eq!(p.feed.status().snapshot().retry_count, 0);
    p.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn feed_ticks_are_written_for_subscribed_pairs() {
    let p = start();
    let btc = Asset::crypto(10, "BTCUSDT");
    p.coordinator.subscribe(1, &btc);
    settle().await;

    let remote = p.exchange.next_remote();
    for (t, close) in [(1_700_000_000_000_i64, "101.5"), (1_700_000_060_000, "102.25")] {
        let frame = format!(
            r#"{{"stream":"btcusdt@kline_1m","data":{{"k":{{"t":{t},"s":"BTCUSDT","o":"100","h":"103","l":"99","c":"{close}","v":"12.5"}}}}}}"#
        );
        remote.events.send(FeedEvent::Text(frame)).await.unwrap();
    }
    // a pair nobody subscribed to is dropped
    remote
        .events
        .send(FeedEvent::Text(
            r#"{"data":{"k":{"t":1700000000000,"s":"DOGEUSDT","o":"1","h":"1","l":"1","c":"1","v":"1"}}}"#
                .to_string(),
        ))
        .await
        .unwrap();
    settle().await;

    let latest = p
        .store
        .latest_timestamp(&btc, QueryKind::Current)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.timestamp_millis(), 1_700_000_060_000);

    let records = p.store.query(&btc, QueryKind::Current, None).await.unwrap();
    assert!(records.iter().any(|r| r.field == "close" && (r.value - 102.25).abs() < 1e-9));
    assert_eq!(p.store.len(&btc, QueryKind::Current), 2);
    p.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn stocks_go_to_the_poller_not_the_feed() {
    let p = start();
    let tsmc = Asset::stock_tw(20, "2330", TwMarket::Twse);

    p.coordinator.subscribe(1, &tsmc);
    settle().await;

    assert_eq!(p.poller.trackable(), vec![tsmc.clone()]);
    assert_eq!(p.exchange.connects(), 0);

    p.coordinator.unsubscribe(1, 20);
    settle().await;
    assert!(p.poller.trackable().is_empty());
    p.cancel.cancel();
}
