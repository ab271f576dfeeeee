//! Transport-neutral client halves
//!
//! The broadcaster writes to a `ClientSink` and reads acknowledgements from
//! a `ClientSource`. The daemon adapts a WebSocket to these traits; tests
//! use plain channels.

use crate::error::SubscriptionError;
use async_trait::async_trait;

/// Frames sent to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    /// Liveness ping, answered with a pong
    Ping(Vec<u8>),
    /// Final frame with a human readable reason
    Close(Option<String>),
}

/// Frames received from the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

#[async_trait]
pub trait ClientSink: Send {
    async fn send(&mut self, frame: OutboundFrame) -> Result<(), SubscriptionError>;
}

#[async_trait]
pub trait ClientSource: Send {
    /// Next frame, or `None` once the client is gone. Must be cancel safe.
    async fn recv(&mut self) -> Option<Result<InboundFrame, SubscriptionError>>;
}
