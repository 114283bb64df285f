//! WebSocket endpoint for subscribers.
//!
//! Each accepted connection gets a [`ChannelSession`]. The client's first
//! `subscribe` frame registers it with the broadcaster, which sends the
//! snapshot; later `subscribe` frames ask for a fresh one.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Broadcaster, ChannelSession, Session};
use crate::model::Incoming;

/// Accepts subscriber connections until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    broadcaster: Arc<Broadcaster>,
    session_buffer: usize,
    cancel: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Subscriber endpoint listening");
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let broadcaster = Arc::clone(&broadcaster);
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        handle_connection(stream, peer, broadcaster, session_buffer, cancel).await;
                    });
                }
                Err(e) => warn!(error = %e, "Failed to accept subscriber connection"),
            }
        }
    }

    info!("Subscriber endpoint stopped");
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    broadcaster: Arc<Broadcaster>,
    session_buffer: usize,
    cancel: CancellationToken,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let (mut sink, mut source) = ws.split();

    let (session, mut outbound) = ChannelSession::new(session_buffer);
    let id = session.id();
    let writer = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if sink.send(Message::text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });
    let mut unregistered = Some(session);
    debug!(%peer, session = %id, "Subscriber connection accepted");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => match Incoming::parse(&text) {
                    Ok(Incoming::Subscribe) => {
                        let result = match unregistered.take() {
                            Some(session) => broadcaster.subscribe(Arc::new(session)).await,
                            None => broadcaster.send_snapshot(id).await,
                        };
                        if let Err(e) = result {
                            warn!(%peer, session = %id, error = %e, "Could not deliver snapshot");
                            break;
                        }
                    }
                    Ok(other) => debug!(session = %id, frame = ?other, "Ignoring client frame"),
                    Err(e) => debug!(session = %id, error = %e, "Ignoring malformed client frame"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session = %id, error = %e, "Subscriber connection error");
                    break;
                }
            }
        }
    }

    broadcaster.unsubscribe(id);
    writer.abort();
}
