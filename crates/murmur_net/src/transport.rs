//! WebSocket mailbox transport.
//!
//! Every node runs one mailbox server. A node talks to a peer over an
//! outbound [`PeerLink`] into that peer's mailbox, so each peer pair has one
//! connection per direction and the receiver learns who is talking from the
//! envelopes themselves. Everything that happens on the server side is
//! reported to the node's event loop as a [`TransportEvent`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, connect_async};
use tracing::{debug, error, info, trace, warn};

use crate::error::NetworkError;
use crate::identity::PeerId;
use crate::message::Envelope;
use crate::peer::ConnId;

/// Identifies one outbound link, so a failure report from a link that was
/// already replaced can be told apart from one about the current link.
pub type LinkId = u64;

static NEXT_LINK: AtomicU64 = AtomicU64::new(1);

/// An incoming event from the transport layer.
#[derive(Debug)]
pub enum TransportEvent {
    /// An envelope arrived on inbound connection `conn`.
    Frame {
        conn: ConnId,
        remote: SocketAddr,
        envelope: Envelope,
    },
    /// Inbound connection `conn` closed. `peer` is the last sender seen on it.
    Closed { conn: ConnId, peer: Option<PeerId> },
    /// An outbound link could not connect or lost its connection.
    LinkFailed {
        link: LinkId,
        peer: Option<PeerId>,
        endpoint: SocketAddr,
        reason: String,
    },
}

/// Run the mailbox server on an already-bound listener until shutdown.
///
/// Each accepted connection gets its own read loop forwarding frames into
/// `event_tx`. Malformed frames are logged and dropped.
pub async fn run_mailbox(
    listener: TcpListener,
    event_tx: mpsc::Sender<TransportEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut next_conn: ConnId = 1;
    let mut readers: Vec<JoinHandle<()>> = Vec::new();

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, remote)) => {
                        let conn = next_conn;
                        next_conn += 1;
                        readers.retain(|task| !task.is_finished());
                        readers.push(tokio::spawn(read_connection(stream, remote, conn, event_tx.clone())));
                    }
                    Err(e) => {
                        error!("Mailbox accept failed: {e}");
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("Mailbox server shutting down");
                break;
            }
        }
    }

    for task in readers {
        task.abort();
    }
}

async fn read_connection(
    stream: tokio::net::TcpStream,
    remote: SocketAddr,
    conn: ConnId,
    event_tx: mpsc::Sender<TransportEvent>,
) {
    let mut ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket accept failed for {remote}: {e}");
            return;
        }
    };
    debug!("Inbound mailbox connection #{conn} from {remote}");

    let mut last_sender = None;
    while let Some(msg) = ws_stream.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => match Envelope::from_json(&text) {
                Ok(envelope) => {
                    last_sender = Some(envelope.sender);
                    let event = TransportEvent::Frame {
                        conn,
                        remote,
                        envelope,
                    };
                    if event_tx.send(event).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!("Bad envelope from {remote}: {e}");
                }
            },
            Ok(WsMessage::Close(_)) => {
                debug!("Peer {remote} sent close");
                break;
            }
            Ok(_) => {} // Ignore binary/ping/pong
            Err(e) => {
                debug!("Read error from {remote}: {e}");
                break;
            }
        }
    }

    let _ = event_tx
        .send(TransportEvent::Closed {
            conn,
            peer: last_sender,
        })
        .await;
}

/// Outbound link to one peer's mailbox.
///
/// Frames are queued without blocking; a background task connects, then
/// writes them in order. Dropping the queue side via [`PeerLink::close`]
/// lets the task flush what is queued and close the socket.
pub struct PeerLink {
    id: LinkId,
    endpoint: SocketAddr,
    outbox: mpsc::Sender<Envelope>,
    task: JoinHandle<()>,
}

impl PeerLink {
    /// Start connecting to `endpoint`. `peer` is `None` for greeting links to
    /// addresses whose owner we do not know yet.
    pub fn spawn(
        peer: Option<PeerId>,
        endpoint: SocketAddr,
        connect_timeout: Duration,
        capacity: usize,
        event_tx: mpsc::Sender<TransportEvent>,
    ) -> Self {
        let id = NEXT_LINK.fetch_add(1, Ordering::Relaxed);
        let (outbox, rx) = mpsc::channel(capacity);
        let task = tokio::spawn(write_link(id, peer, endpoint, connect_timeout, rx, event_tx));
        Self {
            id,
            endpoint,
            outbox,
            task,
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Queue a frame. Fails when the outbox is full or the link is gone.
    pub fn send(&self, envelope: Envelope) -> Result<(), NetworkError> {
        self.outbox.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                NetworkError::Transport(format!("Outbox to {} is full", self.endpoint))
            }
            mpsc::error::TrySendError::Closed(_) => {
                NetworkError::Transport(format!("Link to {} is closed", self.endpoint))
            }
        })
    }

    /// Stop accepting frames. The returned handle finishes once the queued
    /// frames are written and the socket is closed.
    pub fn close(self) -> JoinHandle<()> {
        drop(self.outbox);
        self.task
    }
}

async fn write_link(
    link: LinkId,
    peer: Option<PeerId>,
    endpoint: SocketAddr,
    connect_timeout: Duration,
    mut rx: mpsc::Receiver<Envelope>,
    event_tx: mpsc::Sender<TransportEvent>,
) {
    let url = format!("ws://{endpoint}");
    let fail = |reason: String| TransportEvent::LinkFailed {
        link,
        peer,
        endpoint,
        reason,
    };

    let mut ws_stream = match tokio::time::timeout(connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok((ws, _))) => ws,
        Ok(Err(e)) => {
            let _ = event_tx.send(fail(format!("Connect to {endpoint} failed: {e}"))).await;
            return;
        }
        Err(_) => {
            let _ = event_tx
                .send(fail(format!("Connect to {endpoint} timed out after {connect_timeout:?}")))
                .await;
            return;
        }
    };
    debug!("Outbound link to {endpoint} open");

    while let Some(envelope) = rx.recv().await {
        let json = match envelope.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("Cannot encode {} for {endpoint}: {e}", envelope.message.kind());
                continue;
            }
        };
        trace!("-> {endpoint} {} #{}", envelope.message.kind(), envelope.sequence);
        if let Err(e) = ws_stream.send(WsMessage::Text(json.into())).await {
            let _ = event_tx.send(fail(format!("Send to {endpoint} failed: {e}"))).await;
            return;
        }
    }

    let _ = ws_stream.close(None).await;
    debug!("Outbound link to {endpoint} closed");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
