use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::protocol::UpstreamEvent;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("connect timed out")]
    Timeout,
}

/// Open the upstream WebSocket, bounding the handshake with a timeout.
pub async fn connect(url: &str, timeout: Duration) -> Result<WsStream, TransportError> {
    match tokio::time::timeout(timeout, connect_async(url)).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(TransportError::Handshake(e.to_string())),
        Err(_) => Err(TransportError::Timeout),
    }
}

/// Decode one frame into a domain event.
///
/// Only text frames carry events; protocol ping/pong and binary frames are
/// inbound activity but not events. Unparseable payloads are logged and
/// dropped rather than killing the connection.
pub fn decode_frame(message: &Message) -> Option<UpstreamEvent> {
    match message {
        Message::Text(text) => match serde_json::from_str::<UpstreamEvent>(text.as_str()) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(error = %e, payload = %text, "Failed to parse upstream frame");
                None
            }
        },
        _ => None,
    }
}
