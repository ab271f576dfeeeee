//! WebSocket halves adapted to the broadcaster's client traits

use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use fleet_agent_lib::broadcast::{ClientSink, ClientSource, InboundFrame, OutboundFrame};
use fleet_agent_lib::SubscriptionError;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};

pub struct WsSink {
    inner: SplitSink<WebSocket, Message>,
}

pub struct WsSource {
    inner: SplitStream<WebSocket>,
}

/// Split an upgraded socket into broadcaster halves
pub fn split(socket: WebSocket) -> (WsSink, WsSource) {
    let (sink, stream) = socket.split();
    (WsSink { inner: sink }, WsSource { inner: stream })
}

pub fn to_message(frame: OutboundFrame) -> Message {
    match frame {
        OutboundFrame::Text(text) => Message::Text(text),
        OutboundFrame::Ping(payload) => Message::Ping(payload),
        OutboundFrame::Close(reason) => Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: reason.unwrap_or_default().into(),
        })),
    }
}

pub fn from_message(message: Message) -> InboundFrame {
    match message {
        Message::Text(text) => InboundFrame::Text(text),
        Message::Binary(data) => InboundFrame::Binary(data),
        Message::Ping(data) => InboundFrame::Ping(data),
        Message::Pong(data) => InboundFrame::Pong(data),
        Message::Close(_) => InboundFrame::Close,
    }
}

#[async_trait]
impl ClientSink for WsSink {
    async fn send(&mut self, frame: OutboundFrame) -> Result<(), SubscriptionError> {
        self.inner
            .send(to_message(frame))
            .await
            .map_err(|e| SubscriptionError::Send(e.to_string()))
    }
}

#[async_trait]
impl ClientSource for WsSource {
    async fn recv(&mut self) -> Option<Result<InboundFrame, SubscriptionError>> {
        self.inner.next().await.map(|message| {
            message
                .map(from_message)
                .map_err(|e| SubscriptionError::Receive(e.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_frame_carries_reason() {
        match to_message(OutboundFrame::Close(Some("container gone".into()))) {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, close_code::NORMAL);
                assert_eq!(frame.reason, "container gone");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_pong_maps_to_acknowledgement() {
        assert_eq!(
            from_message(Message::Pong(vec![1])),
            InboundFrame::Pong(vec![1])
        );
        assert_eq!(from_message(Message::Close(None)), InboundFrame::Close);
    }
}
