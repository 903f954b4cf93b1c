//! Transport seam for the live event stream
//!
//! The connection driver is written against these traits so the reconnect
//! and subscription logic can be exercised with a scripted transport.

use async_trait::async_trait;
use dripline_common::{Error, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::warn;

/// Server-initiated close detail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

/// Inbound transport frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close(Option<CloseReason>),
}

/// Opens persistent streaming connections
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn TransportStream>>;
}

/// One established streaming connection
#[async_trait]
pub trait TransportStream: Send {
    /// Send a text frame
    async fn send(&mut self, text: String) -> Result<()>;

    /// Receive the next frame; `None` means the stream ended
    async fn recv(&mut self) -> Option<Frame>;

    /// Close the connection cleanly
    async fn close(&mut self) -> Result<()>;
}

/// WebSocket transport
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &str) -> Result<Box<dyn TransportStream>> {
        let (inner, _response) = connect_async(url)
            .await
            .map_err(|e| Error::Transport(format!("WebSocket connect failed: {}", e)))?;

        Ok(Box::new(WsStream { inner }))
    }
}

struct WsStream {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl TransportStream for WsStream {
    async fn send(&mut self, text: String) -> Result<()> {
        self.inner
            .send(Message::Text(text))
            .await
            .map_err(|e| Error::Transport(format!("WebSocket send failed: {}", e)))
    }

    async fn recv(&mut self) -> Option<Frame> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Frame::Text(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Frame::Text(text)),
                    Err(_) => warn!("Dropping non-UTF-8 binary frame"),
                },
                Ok(Message::Ping(payload)) => {
                    let _ = self.inner.send(Message::Pong(payload)).await;
                }
                Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                Ok(Message::Close(frame)) => {
                    return Some(Frame::Close(frame.map(|f| CloseReason {
                        code: f.code.into(),
                        reason: f.reason.into_owned(),
                    })));
                }
                Err(e) => {
                    warn!("WebSocket read error: {}", e);
                    return None;
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.inner
            .close(None)
            .await
            .map_err(|e| Error::Transport(format!("WebSocket close failed: {}", e)))
    }
}
