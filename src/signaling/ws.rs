use super::transport::{SignalingDialer, SignalingLink};
use crate::error::SignalingError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Dials the relay over WebSocket; one JSON envelope per text frame.
#[derive(Debug, Clone)]
pub struct WsDialer {
    url: String,
}

impl WsDialer {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl SignalingDialer for WsDialer {
    async fn dial(&self) -> Result<Box<dyn SignalingLink>, SignalingError> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| SignalingError::Unreachable(format!("{}: {e}", self.url)))?;
        debug!("websocket connected to {}", self.url);
        Ok(Box::new(WsLink { stream }))
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl SignalingLink for WsLink {
    async fn send(&mut self, text: String) -> Result<(), SignalingError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| SignalingError::AbnormalClose(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, SignalingError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => {
                    return Some(
                        String::from_utf8(bytes)
                            .map_err(|e| SignalingError::Malformed(e.to_string())),
                    )
                }
                Ok(Message::Close(frame)) => {
                    debug!("relay sent close: {frame:?}");
                    return None;
                }
                // ping/pong are answered by tungstenite
                Ok(_) => continue,
                Err(e) => return Some(Err(SignalingError::AbnormalClose(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("websocket close: {e}");
        }
    }
}
