//! Dual-mode session abstraction.
//!
//! A session is a logical bidirectional message channel between two view
//! executions, identified by a SessionID and grouped under a ContextID.
//! Two variants share one contract: [`NetworkSession`], backed by a live
//! QUIC stream to a remote node, and [`LoopbackSession`], used when the
//! counterpart is the node itself, with no serialization or network I/O.
//!
//! Ordering: each session is single-producer single-consumer FIFO.
//! Backpressure: the inbound buffer is bounded; a full buffer blocks the
//! producer until the consumer drains.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::metrics::BandwidthMetrics;
use crate::wire::{self, Message, Status};

/// Inbound buffer capacity per session.
pub const SESSION_BUFFER: usize = 10;

/// Generate a fresh SessionID: 24 random bytes, base64-encoded.
/// Globally unique given a correct RNG.
pub fn random_session_id() -> String {
    let mut nonce = [0u8; 24];
    rand::rng().fill_bytes(&mut nonce);
    BASE64.encode(nonce)
}

/// Immutable snapshot of session metadata.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub caller: String,
    /// Remote endpoint identifier.
    pub endpoint: String,
    /// Remote endpoint public-key identifier.
    pub pkid: Vec<u8>,
    pub closed: bool,
}

/// Metadata shared by both variants. `closed`, once set, is never reset.
#[derive(Debug)]
struct SessionMeta {
    id: String,
    context_id: String,
    caller: String,
    endpoint: String,
    pkid: Vec<u8>,
    closed: AtomicBool,
    /// Cancelled by `close()`; unblocks pending receives.
    token: CancellationToken,
}

impl SessionMeta {
    fn new(id: String, context_id: String, caller: String, endpoint: String, pkid: Vec<u8>) -> Self {
        Self {
            id,
            context_id,
            caller,
            endpoint,
            pkid,
            closed: AtomicBool::new(false),
            token: CancellationToken::new(),
        }
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            caller: self.caller.clone(),
            endpoint: self.endpoint.clone(),
            pkid: self.pkid.clone(),
            closed: self.closed.load(Ordering::SeqCst),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.token.cancel();
    }
}

/// Receive the next message, or `None` once the session is closed.
/// Close wins over queued messages, so undelivered messages are
/// discarded after `close()`.
async fn recv_inner(meta: &SessionMeta, inbound: &Mutex<mpsc::Receiver<Message>>) -> Option<Message> {
    let mut rx = inbound.lock().await;
    tokio::select! {
        biased;
        _ = meta.token.cancelled() => None,
        msg = rx.recv() => msg,
    }
}

fn try_recv_inner(meta: &SessionMeta, inbound: &Mutex<mpsc::Receiver<Message>>) -> Option<Message> {
    if meta.closed.load(Ordering::SeqCst) {
        return None;
    }
    inbound.try_lock().ok()?.try_recv().ok()
}

// ---------------------------------------------------------------------------
// Network-stream variant
// ---------------------------------------------------------------------------

/// Session backed by a live QUIC stream to a remote node. Outgoing
/// messages are serialized onto the stream; inbound messages arrive on a
/// bounded channel filled by the dispatcher.
#[derive(Debug)]
pub struct NetworkSession {
    meta: Arc<SessionMeta>,
    local_endpoint: String,
    local_pkid: Vec<u8>,
    stream: Arc<Mutex<iroh::endpoint::SendStream>>,
    inbound: Mutex<mpsc::Receiver<Message>>,
    metrics: Arc<BandwidthMetrics>,
}

impl NetworkSession {
    /// Build a network session and hand back the delivery sender the
    /// session table keeps for the dispatcher.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session_id: String,
        context_id: String,
        caller: String,
        remote_endpoint: String,
        remote_pkid: Vec<u8>,
        stream: Arc<Mutex<iroh::endpoint::SendStream>>,
        local_endpoint: String,
        local_pkid: Vec<u8>,
        metrics: Arc<BandwidthMetrics>,
    ) -> (Self, mpsc::Sender<Message>) {
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        let session = Self {
            meta: Arc::new(SessionMeta::new(
                session_id,
                context_id,
                caller,
                remote_endpoint,
                remote_pkid,
            )),
            local_endpoint,
            local_pkid,
            stream,
            inbound: Mutex::new(rx),
            metrics,
        };
        (session, tx)
    }

    async fn send_with(&self, status: Status, payload: &[u8]) -> Result<(), Error> {
        if self.meta.closed.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed);
        }
        let msg = Message {
            session_id: self.meta.id.clone(),
            context_id: self.meta.context_id.clone(),
            caller: self.meta.caller.clone(),
            from_endpoint: self.local_endpoint.clone(),
            from_pkid: self.local_pkid.clone(),
            status,
            payload: payload.to_vec(),
        };
        let mut stream = self.stream.lock().await;
        wire::write_msg(&mut stream, &msg, &self.metrics).await
    }
}

// ---------------------------------------------------------------------------
// Loopback variant
// ---------------------------------------------------------------------------

/// Session whose counterpart is the node itself. Messages go straight
/// onto an internal bounded channel; the zero-hop fast path for
/// same-node view interaction.
#[derive(Debug)]
pub struct LoopbackSession {
    meta: Arc<SessionMeta>,
    tx: mpsc::Sender<Message>,
    inbound: Mutex<mpsc::Receiver<Message>>,
}

impl LoopbackSession {
    pub fn new(context_id: &str, caller: &str, endpoint: &str, pkid: Vec<u8>) -> Self {
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        Self {
            meta: Arc::new(SessionMeta::new(
                random_session_id(),
                context_id.to_string(),
                caller.to_string(),
                endpoint.to_string(),
                pkid,
            )),
            tx,
            inbound: Mutex::new(rx),
        }
    }

    async fn send_with(&self, status: Status, payload: &[u8]) -> Result<(), Error> {
        if self.meta.closed.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed);
        }
        let msg = Message {
            session_id: self.meta.id.clone(),
            context_id: self.meta.context_id.clone(),
            caller: self.meta.caller.clone(),
            from_endpoint: self.meta.endpoint.clone(),
            from_pkid: self.meta.pkid.clone(),
            status,
            payload: payload.to_vec(),
        };
        self.tx
            .send(msg)
            .await
            .map_err(|_| Error::Transport("loopback channel dropped".into()))
    }
}

// ---------------------------------------------------------------------------
// Unified contract
// ---------------------------------------------------------------------------

/// The session contract shared by both variants. Higher layers treat
/// local and remote interactions identically through this type.
#[derive(Debug)]
pub enum Session {
    Network(NetworkSession),
    Loopback(LoopbackSession),
}

impl Session {
    fn meta(&self) -> &SessionMeta {
        match self {
            Session::Network(s) => &s.meta,
            Session::Loopback(s) => &s.meta,
        }
    }

    /// Snapshot of the session metadata.
    pub fn info(&self) -> SessionInfo {
        self.meta().info()
    }

    /// The context this session belongs to, fixed for its lifetime.
    pub fn context_id(&self) -> &str {
        &self.meta().context_id
    }

    /// Deliver `payload` to the counterpart with `Status::Ok`. Errors
    /// only on local construction or transport failure.
    pub async fn send(&self, payload: &[u8]) -> Result<(), Error> {
        match self {
            Session::Network(s) => s.send_with(Status::Ok, payload).await,
            Session::Loopback(s) => s.send_with(Status::Ok, payload).await,
        }
    }

    /// Like [`send`](Self::send) but with `Status::Error`, signalling an
    /// application-level failure distinctly from a transport failure.
    pub async fn send_error(&self, payload: &[u8]) -> Result<(), Error> {
        match self {
            Session::Network(s) => s.send_with(Status::Error, payload).await,
            Session::Loopback(s) => s.send_with(Status::Error, payload).await,
        }
    }

    /// Await the next inbound message. `None` is terminal: the session
    /// was closed.
    pub async fn recv(&self) -> Option<Message> {
        match self {
            Session::Network(s) => recv_inner(&s.meta, &s.inbound).await,
            Session::Loopback(s) => recv_inner(&s.meta, &s.inbound).await,
        }
    }

    /// Non-blocking check for an inbound message. Returns `None` when
    /// nothing is ready, including while a concurrent [`recv`](Self::recv)
    /// holds the receiver; queued messages then go to that receive.
    pub fn try_recv(&self) -> Option<Message> {
        match self {
            Session::Network(s) => try_recv_inner(&s.meta, &s.inbound),
            Session::Loopback(s) => try_recv_inner(&s.meta, &s.inbound),
        }
    }

    /// Mark the session closed and unblock pending receives. Idempotent;
    /// `closed` is never reset. The underlying stream is released when
    /// the session is dropped.
    pub fn close(&self) {
        self.meta().close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_nonempty_and_distinct() {
        let a = random_session_id();
        let b = random_session_id();
        assert!(!a.is_empty());
        assert_ne!(a, b);
        // 24 bytes of nonce -> 32 base64 characters.
        assert_eq!(a.len(), 32);
    }
}
