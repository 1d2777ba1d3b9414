//! Exchange Feed
//!
//! Streaming kline feed from the crypto exchange: frame codec, transport,
//! reconnect backoff, connection liveness and the connection manager that
//! ties them together.

pub mod backoff;
pub mod codec;
pub mod connection;
pub mod liveness;
pub mod transport;

pub use backoff::Backoff;
pub use codec::{CodecError, FeedCodec, FeedCommand, FeedMethod, InboundFrame};
pub use connection::{
    ConnectionSnapshot, ConnectionState, ConnectionStatus, FeedHandle, StreamConnectionManager,
};
pub use liveness::{ConnectionClock, LivenessMonitor, RotationDue};
pub use transport::{
    FeedConnector, FeedError, FeedEvent, FeedSession, OutboundFrame, WebSocketConnector,
};
