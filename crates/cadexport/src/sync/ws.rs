//! WebSocket transport for [`SyncClient`](super::SyncClient).

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::info;

use super::{Connection, Connector, FrameSink, FrameStream};
use crate::error::SyncError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to a broadcaster's subscriber endpoint, e.g. `ws://127.0.0.1:8765`.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Connection, SyncError> {
        let (socket, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| SyncError::Connect(format!("{}: {e}", self.url)))?;
        info!(url = %self.url, "Connected to broadcaster");

        let (sink, stream) = socket.split();
        Ok(Connection {
            sink: Box::new(WsSink(sink)),
            stream: Box::new(WsStream(stream)),
        })
    }
}

struct WsSink(SplitSink<Socket, Message>);

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, text: String) -> Result<(), SyncError> {
        self.0
            .send(Message::text(text))
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.0.close().await;
    }
}

struct WsStream(SplitStream<Socket>);

#[async_trait]
impl FrameStream for WsStream {
    async fn next(&mut self) -> Option<Result<String, SyncError>> {
        loop {
            match self.0.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(SyncError::Transport(e.to_string()))),
            }
        }
    }
}
