//! Inbound stream demultiplexing.
//!
//! The node claims one ALPN on the overlay. Every accepted stream is
//! read by its own task; each decoded envelope goes onto a shared
//! dispatch queue. A single dispatcher task drains the queue and routes
//! messages to the session-table entry keyed by (SessionID, ContextID),
//! creating the entry on first arrival.
//!
//! Delivery into a session's bounded inbound channel blocks the
//! dispatcher when the channel is full, so a slow consumer on one
//! session can delay delivery to the others sharing this dispatcher.
//! Node cancellation aborts a blocked delivery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use iroh::endpoint::Connection;
use iroh::protocol::{AcceptError, ProtocolHandler};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;
use crate::metrics::BandwidthMetrics;
use crate::session::{NetworkSession, Session};
use crate::wire::{self, Message};

/// Dispatch queue capacity shared by all inbound streams.
pub const DISPATCH_QUEUE: usize = 64;

/// Session-table key. A session belongs to exactly one context for its
/// whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub session_id: String,
    pub context_id: String,
}

/// One decoded envelope plus the send half of the stream it arrived on,
/// so a dispatcher-created session can reply on the same stream.
#[derive(Debug)]
pub(crate) struct Inbound {
    pub message: Message,
    pub reply: Arc<tokio::sync::Mutex<iroh::endpoint::SendStream>>,
}

pub(crate) struct SessionEntry {
    /// Sender side of the session's bounded inbound channel.
    pub deliver: mpsc::Sender<Message>,
    pub session: Arc<Session>,
}

/// Session registry guarded by its own lock. The lock is never held
/// across an await.
#[derive(Default)]
pub struct SessionTable {
    inner: Mutex<HashMap<SessionKey, SessionEntry>>,
}

impl SessionTable {
    pub(crate) fn insert(&self, key: SessionKey, entry: SessionEntry) {
        self.inner.lock().unwrap().insert(key, entry);
    }

    pub(crate) fn deliver_for(&self, key: &SessionKey) -> Option<mpsc::Sender<Message>> {
        self.inner.lock().unwrap().get(key).map(|e| e.deliver.clone())
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.inner.lock().unwrap().get(key).map(|e| e.session.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A live inbound or outbound stream reader under supervision.
#[derive(Debug)]
pub(crate) struct StreamHandler {
    pub cancel: CancellationToken,
    /// Present for locally spawned readers; accept-side readers are
    /// owned and joined by the protocol router.
    pub task: Option<JoinHandle<()>>,
}

/// Active stream handlers per peer identifier. A peer may hold several
/// concurrent streams.
#[derive(Debug, Default)]
pub struct StreamTable {
    inner: Mutex<HashMap<String, Vec<StreamHandler>>>,
}

impl StreamTable {
    pub(crate) fn register(&self, peer: &str, handler: StreamHandler) {
        self.inner
            .lock()
            .unwrap()
            .entry(peer.to_string())
            .or_default()
            .push(handler);
    }

    pub fn stream_count(&self, peer: &str) -> usize {
        self.inner.lock().unwrap().get(peer).map_or(0, Vec::len)
    }

    /// Remove and return all handlers registered for `peer`.
    pub(crate) fn remove_peer(&self, peer: &str) -> Vec<StreamHandler> {
        self.inner.lock().unwrap().remove(peer).unwrap_or_default()
    }

    pub(crate) fn drain(&self) -> Vec<StreamHandler> {
        self.inner.lock().unwrap().drain().flat_map(|(_, v)| v).collect()
    }
}

// ---------------------------------------------------------------------------
// Protocol handler: one reader task per accepted stream
// ---------------------------------------------------------------------------

/// The protocol handler serving the view-session ALPN. Each accepted
/// connection gets a read loop that feeds the dispatch queue.
#[derive(Debug, Clone)]
pub(crate) struct ViewProtocol {
    pub queue: mpsc::Sender<Inbound>,
    pub streams: Arc<StreamTable>,
    pub metrics: Arc<BandwidthMetrics>,
    pub cancel: CancellationToken,
}

impl ViewProtocol {
    async fn read_loop(&self, conn: Connection) -> Result<(), Error> {
        // Child of the node token: node shutdown propagates, and the
        // stream table can cancel this one reader alone.
        let stream_cancel = self.cancel.child_token();
        let (send, mut recv) = tokio::select! {
            _ = stream_cancel.cancelled() => return Ok(()),
            res = conn.accept_bi() => res.map_err(|e| Error::Transport(e.to_string()))?,
        };
        let reply = Arc::new(tokio::sync::Mutex::new(send));

        let mut registered = false;
        loop {
            let msg = tokio::select! {
                biased;
                _ = stream_cancel.cancelled() => break,
                res = wire::read_msg(&mut recv, &self.metrics) => match res {
                    Ok(m) => m,
                    Err(_) => {
                        debug!("inbound stream closed");
                        break;
                    }
                },
            };
            if !registered {
                self.streams.register(
                    &msg.from_endpoint,
                    StreamHandler {
                        cancel: stream_cancel.clone(),
                        task: None,
                    },
                );
                registered = true;
            }
            let item = Inbound {
                message: msg,
                reply: reply.clone(),
            };
            if self.queue.send(item).await.is_err() {
                // Dispatcher gone: the node is shutting down.
                break;
            }
        }
        Ok(())
    }
}

impl ProtocolHandler for ViewProtocol {
    async fn accept(&self, connection: Connection) -> std::result::Result<(), AcceptError> {
        if let Err(e) = self.read_loop(connection).await {
            warn!("inbound stream handler error: {e}");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dispatcher task
// ---------------------------------------------------------------------------

/// Drains the dispatch queue and routes each message to its session,
/// creating network sessions for unseen (SessionID, ContextID) pairs.
pub(crate) struct Dispatcher {
    pub sessions: Arc<SessionTable>,
    /// Announces dispatcher-created sessions to the application.
    pub incoming_tx: mpsc::Sender<Arc<Session>>,
    pub local_endpoint: String,
    pub local_pkid: Vec<u8>,
    pub metrics: Arc<BandwidthMetrics>,
    pub cancel: CancellationToken,
}

impl Dispatcher {
    pub(crate) async fn run(self, mut queue: mpsc::Receiver<Inbound>) {
        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => break,
                item = queue.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            self.route(item).await;
        }
        debug!("dispatcher stopped");
    }

    async fn route(&self, item: Inbound) {
        let key = SessionKey {
            session_id: item.message.session_id.clone(),
            context_id: item.message.context_id.clone(),
        };

        let deliver = match self.sessions.deliver_for(&key) {
            Some(deliver) => deliver,
            None => {
                let (session, deliver) = NetworkSession::new(
                    item.message.session_id.clone(),
                    item.message.context_id.clone(),
                    item.message.caller.clone(),
                    item.message.from_endpoint.clone(),
                    item.message.from_pkid.clone(),
                    item.reply.clone(),
                    self.local_endpoint.clone(),
                    self.local_pkid.clone(),
                    self.metrics.clone(),
                );
                let session = Arc::new(Session::Network(session));
                self.sessions.insert(
                    key.clone(),
                    SessionEntry {
                        deliver: deliver.clone(),
                        session: session.clone(),
                    },
                );
                debug!(
                    session_id = %key.session_id,
                    context_id = %key.context_id,
                    from = %item.message.from_endpoint,
                    pkid = %hex::encode(&item.message.from_pkid),
                    "new inbound session"
                );
                if self.incoming_tx.try_send(session).is_err() {
                    warn!(
                        session_id = %key.session_id,
                        "incoming-session queue full, announcement dropped"
                    );
                }
                deliver
            }
        };

        // Bounded channel: a full buffer blocks the dispatcher until the
        // consumer drains. Cancellation aborts the delivery so shutdown
        // is never held up by a slow consumer.
        tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!(session_id = %key.session_id, "dispatcher cancelled, message discarded");
            }
            res = deliver.send(item.message) => {
                if res.is_err() {
                    debug!(session_id = %key.session_id, "session receiver dropped, message discarded");
                }
            }
        }
    }
}
