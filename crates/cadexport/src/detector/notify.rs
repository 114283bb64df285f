//! Push-mode detection: debounced per-id notifications.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DetectorContext, NotificationSource, NotificationStream, StateCache};
use crate::config::DetectorConfig;
use crate::error::DetectorError;
use crate::model::ChangeEvent;

/// Consumes a [`NotificationSource`], coalescing bursts per job id.
///
/// A burst is resolved once its first notification is `notify_debounce` old:
/// the record is re-read and compared against the last known fingerprint, so
/// only genuine changes are published.
pub struct NotifyDetector {
    source: Arc<dyn NotificationSource>,
    ctx: DetectorContext,
    config: DetectorConfig,
    cache: StateCache,
}

impl NotifyDetector {
    pub fn new(
        source: Arc<dyn NotificationSource>,
        ctx: DetectorContext,
        config: DetectorConfig,
    ) -> Self {
        Self {
            source,
            ctx,
            config,
            cache: StateCache::default(),
        }
    }

    /// Subscribes, consumes until the channel fails, waits and resubscribes.
    /// Returns only on cancellation.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Change detector started in notify mode");
        loop {
            match self.source.subscribe().await {
                Ok(stream) => {
                    if let Err(e) = self.prime() {
                        warn!(error = %e, "Failed to load job states after subscribing");
                    }
                    match self.consume(stream, &cancel).await {
                        Ok(()) => break,
                        Err(e) => warn!(error = %e, "Notification channel failed"),
                    }
                }
                Err(e) => warn!(error = %e, "Failed to subscribe to notifications"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay()) => {
                    debug!("Resubscribing to notifications");
                }
            }
        }
        info!("Change detector stopped");
    }

    fn prime(&mut self) -> Result<(), DetectorError> {
        let jobs = self.ctx.store().list(None, self.config.scan_limit, 0)?;
        self.cache.prime(&jobs);
        Ok(())
    }

    /// `Ok` on cancellation, `Err` when the stream fails or closes.
    async fn consume(
        &mut self,
        mut stream: Box<dyn NotificationStream>,
        cancel: &CancellationToken,
    ) -> Result<(), DetectorError> {
        let debounce = self.config.notify_debounce();
        let mut due: HashMap<String, Instant> = HashMap::new();

        loop {
            let next_deadline = due.values().min().copied();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = async { sleep_until(next_deadline.unwrap_or_else(Instant::now)).await },
                    if next_deadline.is_some() =>
                {
                    let now = Instant::now();
                    let mut ready: Vec<String> = due
                        .iter()
                        .filter(|(_, at)| **at <= now)
                        .map(|(id, _)| id.clone())
                        .collect();
                    ready.sort();
                    for id in ready {
                        due.remove(&id);
                        self.resolve(&id).await;
                    }
                }
                next = stream.next() => match next? {
                    Some(notification) => {
                        debug!(job_id = %notification.job_id, op = ?notification.op, "Change notification");
                        due.entry(notification.job_id)
                            .or_insert_with(|| Instant::now() + debounce);
                    }
                    None => {
                        return Err(DetectorError::Channel("notification stream closed".to_string()))
                    }
                },
            }
        }
    }

    async fn resolve(&mut self, id: &str) {
        let event = match self.ctx.store().get(id) {
            Ok(Some(job)) => self.cache.observe(&job),
            Ok(None) => self
                .cache
                .forget(id)
                .then(|| ChangeEvent::Delete(id.to_string())),
            Err(e) => {
                warn!(job_id = %id, error = %e, "Failed to read changed job");
                None
            }
        };
        if let Some(event) = event {
            self.ctx.publish(event).await;
        }
    }
}
