//! Fan-out of job changes to connected subscribers.
//!
//! Each event is serialized once and offered to every session with a
//! per-session timeout. Sessions that fail are dropped after the pass, so
//! one dead subscriber never blocks delivery to the rest. Emits are
//! serialized: a pass finishes before the next one starts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::join_all;
use tracing::{debug, error, info, warn};

use crate::config::BroadcastConfig;
use crate::error::SendError;
use crate::model::{ChangeEvent, WireMessage};
use crate::store::JobStore;

mod session;
pub mod ws;

pub use session::{ChannelSession, Session, SessionId};

/// Outcome of one delivery pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: Vec<SessionId>,
}

pub struct Broadcaster {
    store: Arc<dyn JobStore>,
    config: BroadcastConfig,
    sessions: Mutex<HashMap<SessionId, Arc<dyn Session>>>,
    dispatch: tokio::sync::Mutex<()>,
}

impl Broadcaster {
    pub fn new(store: Arc<dyn JobStore>, config: BroadcastConfig) -> Self {
        Self {
            store,
            config,
            sessions: Mutex::new(HashMap::new()),
            dispatch: tokio::sync::Mutex::new(()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<dyn Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_count(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_subscribed(&self, id: SessionId) -> bool {
        self.sessions().contains_key(&id)
    }

    /// Registers `session` and sends it the current snapshot.
    ///
    /// No incremental event reaches the session before its snapshot. If the
    /// snapshot cannot be delivered the session is not kept.
    pub async fn subscribe(&self, session: Arc<dyn Session>) -> Result<(), SendError> {
        let _pass = self.dispatch.lock().await;
        let id = session.id();
        let text = self.snapshot_text()?;

        self.deliver(session.as_ref(), &text).await?;
        self.sessions().insert(id, session);
        info!(session = %id, sessions = self.session_count(), "Subscriber connected");
        Ok(())
    }

    pub fn unsubscribe(&self, id: SessionId) -> bool {
        let removed = self.sessions().remove(&id).is_some();
        if removed {
            info!(session = %id, "Subscriber disconnected");
        }
        removed
    }

    /// Re-sends the snapshot to one already registered session.
    pub async fn send_snapshot(&self, id: SessionId) -> Result<(), SendError> {
        let _pass = self.dispatch.lock().await;
        let Some(session) = self.sessions().get(&id).cloned() else {
            return Err(SendError::Closed);
        };
        let text = self.snapshot_text()?;
        if let Err(e) = self.deliver(session.as_ref(), &text).await {
            warn!(session = %id, error = %e, "Dropping subscriber after failed snapshot");
            self.sessions().remove(&id);
            return Err(e);
        }
        Ok(())
    }

    /// Delivers `event` to every session; failed sessions are removed.
    pub async fn emit(&self, event: &ChangeEvent) -> Delivery {
        let _pass = self.dispatch.lock().await;

        let text = match WireMessage::from_event(event).and_then(|m| m.to_text()) {
            Ok(text) => text,
            Err(e) => {
                error!(job_id = %event.job_id(), error = %e, "Failed to encode change event");
                return Delivery::default();
            }
        };

        let targets: Vec<Arc<dyn Session>> = self.sessions().values().cloned().collect();
        if targets.is_empty() {
            return Delivery::default();
        }

        let results = join_all(targets.iter().map(|session| {
            let text = &text;
            async move { (session.id(), self.deliver(session.as_ref(), text).await) }
        }))
        .await;

        let mut delivery = Delivery::default();
        for (id, result) in results {
            match result {
                Ok(()) => delivery.delivered += 1,
                Err(e) => {
                    warn!(session = %id, error = %e, "Dropping subscriber after failed send");
                    delivery.dropped.push(id);
                }
            }
        }

        if !delivery.dropped.is_empty() {
            let mut sessions = self.sessions();
            for id in &delivery.dropped {
                sessions.remove(id);
            }
        }

        debug!(
            job_id = %event.job_id(),
            delivered = delivery.delivered,
            dropped = delivery.dropped.len(),
            "Change event fanned out"
        );
        delivery
    }

    async fn deliver(&self, session: &dyn Session, text: &str) -> Result<(), SendError> {
        match tokio::time::timeout(self.config.send_timeout(), session.send_text(text)).await {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout),
        }
    }

    fn snapshot_text(&self) -> Result<String, SendError> {
        let jobs = self
            .store
            .list(None, self.config.snapshot_limit, 0)
            .map_err(|e| SendError::Snapshot(e.to_string()))?;
        WireMessage::initial(&jobs)
            .and_then(|m| m.to_text())
            .map_err(|e| SendError::Encode(e.to_string()))
    }
}
