//! Feed Transport
//!
//! [`FeedConnector`] opens a session to the exchange and hands back two
//! channels: outbound frames and inbound events. The connection manager only
//! sees these channels, so tests can script a session without a socket.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

/// Capacity of each session channel.
const SESSION_BUFFER: usize = 1024;

/// Feed transport errors.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// Opening the connection failed.
    #[error("feed connection failed: {0}")]
    Connect(String),

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The session task is gone.
    #[error("feed session closed")]
    SessionClosed,
}

/// Frame written to the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// JSON text frame.
    Text(String),
    /// Close the session going-away.
    Close,
}

/// Event read from the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// Text frame.
    Text(String),
    /// Peer closed the session.
    Closed(String),
    /// Transport failure.
    Error(String),
}

/// An open session.
#[derive(Debug)]
pub struct FeedSession {
    /// Frames to send.
    pub outbound: mpsc::Sender<OutboundFrame>,
    /// Events received, in arrival order.
    pub inbound: mpsc::Receiver<FeedEvent>,
}

impl FeedSession {
    /// Send a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::SessionClosed`] if the session task has exited.
    pub async fn send_text(&self, text: String) -> Result<(), FeedError> {
        self.outbound
            .send(OutboundFrame::Text(text))
            .await
            .map_err(|_| FeedError::SessionClosed)
    }

    /// Ask the session to close. A session that already ended is ignored.
    pub async fn close(&self) {
        let _ = self.outbound.send(OutboundFrame::Close).await;
    }
}

/// Opens feed sessions.
#[async_trait]
pub trait FeedConnector: Send + Sync {
    /// Connect to `url`.
    async fn connect(&self, url: &str) -> Result<FeedSession, FeedError>;
}

// =============================================================================
// WebSocket connector
// =============================================================================

/// Connector backed by `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a connector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FeedConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<FeedSession, FeedError> {
        tracing::info!(url, "Connecting to exchange feed");
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| FeedError::Connect(e.to_string()))?;

        let (outbound_tx, outbound_rx) = mpsc::channel(SESSION_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel(SESSION_BUFFER);
        tokio::spawn(pump(ws_stream, outbound_rx, inbound_tx));

        Ok(FeedSession {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Move frames between the socket and the session channels until either
/// side ends. Exactly one terminal event is sent unless the reader is gone.
async fn pump(
    ws_stream: WsStream,
    mut outbound: mpsc::Receiver<OutboundFrame>,
    inbound: mpsc::Sender<FeedEvent>,
) {
    let (mut write, mut read) = ws_stream.split();

    let terminal = loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(OutboundFrame::Text(text)) => {
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            break Some(FeedEvent::Error(e.to_string()));
                        }
                    }
                    Some(OutboundFrame::Close) | None => {
                        let frame = CloseFrame {
                            code: CloseCode::Away,
                            reason: "going away".into(),
                        };
                        if let Err(e) = write.send(Message::Close(Some(frame))).await {
                            tracing::debug!(error = %e, "Close frame not delivered");
                        }
                        break None;
                    }
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if inbound.send(FeedEvent::Text(text.as_str().to_owned())).await.is_err() {
                            break None;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            break Some(FeedEvent::Error(e.to_string()));
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map_or_else(
                            || "closed by peer".to_string(),
                            |f| format!("{} {}", f.code, f.reason),
                        );
                        break Some(FeedEvent::Closed(reason));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Some(FeedEvent::Error(e.to_string())),
                    None => break Some(FeedEvent::Closed("stream ended".to_string())),
                }
            }
        }
    };

    if let Some(event) = terminal {
        let _ = inbound.send(event).await;
    }
}
