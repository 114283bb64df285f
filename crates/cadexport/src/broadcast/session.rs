use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::SendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A subscriber connection able to receive text frames.
#[async_trait]
pub trait Session: Send + Sync {
    fn id(&self) -> SessionId;

    async fn send_text(&self, text: &str) -> Result<(), SendError>;
}

/// Session backed by a bounded channel; the receiving half feeds a transport.
pub struct ChannelSession {
    id: SessionId,
    tx: mpsc::Sender<String>,
}

impl ChannelSession {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: SessionId::new(),
                tx,
            },
            rx,
        )
    }
}

#[async_trait]
impl Session for ChannelSession {
    fn id(&self) -> SessionId {
        self.id
    }

    async fn send_text(&self, text: &str) -> Result<(), SendError> {
        self.tx
            .send(text.to_string())
            .await
            .map_err(|_| SendError::Closed)
    }
}
