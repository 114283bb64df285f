//! Subscriber side of the change stream.
//!
//! [`SyncClient`] keeps a connection to a broadcaster open, reconnecting
//! after a fixed delay, and mirrors the stream into a [`LocalCache`].
//! Incremental events are buffered and written in one batch once the
//! stream has been quiet for the debounce window; `initial` listings are
//! written straight away.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::model::{Incoming, Job, WireMessage};
use crate::store::LocalCache;

mod batch;
pub mod ws;

pub use batch::PendingBatch;
pub use ws::WsConnector;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What the client observed, for consumers that want to react to it.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// A full listing with this many records was applied.
    Initial(usize),
    Insert(Job),
    Update(Job),
    Delete(String),
    Error(String),
}

#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, text: String) -> Result<(), SyncError>;

    async fn close(&mut self);
}

#[async_trait]
pub trait FrameStream: Send {
    /// Next text frame; `None` once the peer closed the connection.
    async fn next(&mut self) -> Option<Result<String, SyncError>>;
}

/// An established connection split into its two halves.
pub struct Connection {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connection, SyncError>;
}

struct Inner {
    connector: Arc<dyn Connector>,
    cache: Arc<dyn LocalCache>,
    config: SyncConfig,
    batch: Mutex<PendingBatch>,
    flush_signal: Notify,
    state: Mutex<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    events: broadcast::Sender<SyncEvent>,
}

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct SyncClient {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SyncClient {
    pub fn new(connector: Arc<dyn Connector>, cache: Arc<dyn LocalCache>, config: SyncConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                connector,
                cache,
                config,
                batch: Mutex::new(PendingBatch::default()),
                flush_signal: Notify::new(),
                state: Mutex::new(ConnectionState::Disconnected),
                outbound: Mutex::new(None),
                events,
            }),
            running: Mutex::new(None),
        }
    }

    /// Spawns the receive loop and the flush task. Calling it while
    /// already running does nothing.
    pub fn start(&self) {
        let mut running = lock(&self.running);
        if running.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let receiver = tokio::spawn(receive_loop(Arc::clone(&self.inner), cancel.clone()));
        let flusher = tokio::spawn(flush_loop(Arc::clone(&self.inner), cancel.clone()));
        *running = Some(Running {
            cancel,
            tasks: vec![receiver, flusher],
        });
    }

    /// Asks the broadcaster for a fresh snapshot.
    pub async fn refresh(&self) -> Result<(), SyncError> {
        let text = WireMessage::subscribe().to_text()?;
        let outbound = lock(&self.inner.outbound).clone();
        match outbound {
            Some(tx) => tx.send(text).map_err(|_| SyncError::NotConnected),
            None => Err(SyncError::NotConnected),
        }
    }

    /// Stops both tasks and writes whatever is still buffered.
    pub async fn disconnect(&self) -> Result<(), SyncError> {
        let running = lock(&self.running).take();
        if let Some(running) = running {
            running.cancel.cancel();
            for task in running.tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "Sync task ended abnormally");
                }
            }
        }
        self.inner.flush()?;
        self.inner.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    /// Operations waiting for the next flush.
    pub fn pending(&self) -> usize {
        lock(&self.inner.batch).len()
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    fn publish(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    /// Writes the buffered batch: all upserts in one call, deletes after.
    /// Returns the number of records touched.
    fn flush(&self) -> Result<usize, SyncError> {
        let (upserts, deletes) = lock(&self.batch).take();
        if upserts.is_empty() && deletes.is_empty() {
            return Ok(0);
        }

        if !upserts.is_empty() {
            self.cache.upsert_all(&upserts)?;
        }
        for id in &deletes {
            self.cache.remove(id)?;
        }
        debug!(upserts = upserts.len(), deletes = deletes.len(), "Flushed pending batch");
        Ok(upserts.len() + deletes.len())
    }

    fn flush_logged(&self) {
        if let Err(e) = self.flush() {
            error!(error = %e, "Failed to write pending batch");
            self.publish(SyncEvent::Error(e.to_string()));
        }
    }

    fn handle_frame(&self, text: &str) {
        let incoming = match Incoming::parse(text) {
            Ok(incoming) => incoming,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed frame");
                self.publish(SyncEvent::Error(e.to_string()));
                return;
            }
        };

        match incoming {
            Incoming::Initial(jobs) => {
                let count = jobs.len();
                {
                    let mut batch = lock(&self.batch);
                    for job in jobs {
                        batch.push_upsert(job);
                    }
                }
                self.flush_logged();
                info!(jobs = count, "Applied initial listing");
                self.publish(SyncEvent::Initial(count));
            }
            Incoming::Insert(job) => {
                lock(&self.batch).push_upsert(job.clone());
                self.flush_signal.notify_one();
                self.publish(SyncEvent::Insert(job));
            }
            Incoming::Update(job) => {
                lock(&self.batch).push_upsert(job.clone());
                self.flush_signal.notify_one();
                self.publish(SyncEvent::Update(job));
            }
            Incoming::Delete(id) => {
                lock(&self.batch).push_delete(id.clone());
                self.flush_signal.notify_one();
                self.publish(SyncEvent::Delete(id));
            }
            Incoming::Subscribe | Incoming::Unknown(_) => {
                debug!("Ignoring frame not meant for subscribers");
            }
        }
    }

    /// Runs one connection until it drops or `cancel` fires.
    async fn run_connection(&self, connection: Connection, cancel: &CancellationToken) {
        let Connection {
            mut sink,
            mut stream,
        } = connection;

        let (tx, mut rx) = mpsc::unbounded_channel();
        *lock(&self.outbound) = Some(tx);

        match WireMessage::subscribe().to_text() {
            Ok(text) => {
                if let Err(e) = sink.send(text).await {
                    warn!(error = %e, "Failed to send subscribe frame");
                    *lock(&self.outbound) = None;
                    return;
                }
            }
            Err(e) => error!(error = %e, "Failed to encode subscribe frame"),
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    sink.close().await;
                    break;
                }
                Some(text) = rx.recv() => {
                    if let Err(e) = sink.send(text).await {
                        warn!(error = %e, "Send failed");
                        break;
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(text)) => self.handle_frame(&text),
                    Some(Err(e)) => {
                        warn!(error = %e, "Connection error");
                        break;
                    }
                    None => {
                        info!("Connection closed by peer");
                        break;
                    }
                },
            }
        }

        *lock(&self.outbound) = None;
    }
}

async fn receive_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    loop {
        inner.set_state(ConnectionState::Connecting);
        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            result = inner.connector.connect() => result,
        };

        match connected {
            Ok(connection) => {
                inner.set_state(ConnectionState::Connected);
                inner.publish(SyncEvent::Connected);
                info!("Sync connection established");

                inner.run_connection(connection, &cancel).await;

                inner.set_state(ConnectionState::Disconnected);
                inner.publish(SyncEvent::Disconnected);
            }
            Err(e) => {
                inner.set_state(ConnectionState::Disconnected);
                warn!(error = %e, "Sync connection failed");
                inner.publish(SyncEvent::Error(e.to_string()));
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(inner.config.reconnect_delay()) => {
                debug!("Reconnecting");
            }
        }
    }
    inner.set_state(ConnectionState::Disconnected);
}

async fn flush_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    let debounce = inner.config.flush_debounce();
    'outer: loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = inner.flush_signal.notified() => {}
        }

        // Each new signal rearms the window.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break 'outer,
                _ = inner.flush_signal.notified() => continue,
                _ = tokio::time::sleep(debounce) => break,
            }
        }

        inner.flush_logged();
    }
}
