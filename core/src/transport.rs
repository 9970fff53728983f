//! Transport abstraction for the event channel
//!
//! The connection manager only speaks text frames through [`Transport`], so
//! the reconnect and room logic runs unchanged over a real WebSocket or an
//! in-memory pipe.

use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

#[async_trait]
pub trait Transport: Send + 'static {
    /// Open (or re-open) the channel
    async fn connect(&mut self, url: &str, token: &str) -> Result<()>;

    /// Send one text frame
    async fn send(&mut self, frame: String) -> Result<()>;

    /// Next text frame. `Ok(None)` when the peer closed the channel.
    async fn recv(&mut self) -> Result<Option<String>>;

    /// Close the channel; safe to call when already closed
    async fn close(&mut self) -> Result<()>;
}

// ============================================================================
// WebSocket Transport
// ============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Default)]
pub struct WebSocketTransport {
    write: Option<SplitSink<WsStream, WsMessage>>,
    read: Option<SplitStream<WsStream>>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&mut self, url: &str, token: &str) -> Result<()> {
        let parsed = Url::parse(url).map_err(|e| Error::WebSocket(format!("{}: {}", url, e)))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(Error::WebSocket(format!(
                "unsupported scheme {:?}",
                parsed.scheme()
            )));
        }

        let mut request = parsed.as_str().into_client_request()?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| Error::WebSocket(e.to_string()))?;
        request.headers_mut().insert("Authorization", auth);

        let (ws_stream, _) = connect_async(request).await?;
        let (write, read) = ws_stream.split();
        self.write = Some(write);
        self.read = Some(read);
        Ok(())
    }

    async fn send(&mut self, frame: String) -> Result<()> {
        let write = self.write.as_mut().ok_or(Error::NotConnected)?;
        write.send(WsMessage::Text(frame)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        let read = self.read.as_mut().ok_or(Error::NotConnected)?;
        while let Some(msg) = read.next().await {
            match msg? {
                WsMessage::Text(text) => return Ok(Some(text)),
                WsMessage::Close(_) => return Ok(None),
                _ => {}
            }
        }
        Ok(None)
    }

    async fn close(&mut self) -> Result<()> {
        self.read = None;
        if let Some(mut write) = self.write.take() {
            if let Err(e) = write.close().await {
                log::debug!("WebSocket close: {}", e);
            }
        }
        Ok(())
    }
}
