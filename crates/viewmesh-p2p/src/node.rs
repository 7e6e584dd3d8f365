//! The P2P node aggregate.
//!
//! Ties together identity, overlay membership, the peer table, the
//! stream-handler table, and the session table, and supervises the
//! background tasks that keep them fed: the discovery loop, the
//! dispatcher, and one reader per locally opened stream. `shutdown`
//! cancels and joins all of them; no task outlives the node.

use std::net::SocketAddr;
use std::sync::Arc;

use iroh::endpoint::Connection;
use iroh::protocol::Router;
use iroh::{Endpoint, EndpointAddr, EndpointId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discovery::{DiscoveryConfig, DiscoveryEngine, PeerRecord, PeerTable, Rendezvous};
use crate::dispatch::{
    Dispatcher, Inbound, SessionEntry, SessionKey, SessionTable, StreamHandler, StreamTable,
    ViewProtocol, DISPATCH_QUEUE,
};
use crate::error::Error;
use crate::identity::KeySource;
use crate::metrics::BandwidthMetrics;
use crate::session::{random_session_id, LoopbackSession, NetworkSession, Session};
use crate::wire;
use crate::VIEW_ALPN;

/// Capacity of the queue announcing dispatcher-created sessions.
const INCOMING_SESSIONS: usize = 16;

/// Everything a node needs besides its collaborators (rendezvous
/// capability and metrics sink).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// UDP listen address, e.g. `"127.0.0.1:0"`.
    pub listen_addr: String,
    pub key: KeySource,
    pub discovery: DiscoveryConfig,
}

impl NodeConfig {
    /// Ephemeral node on an OS-assigned local port.
    pub fn ephemeral() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            key: KeySource::generate(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

/// A running node: overlay endpoint plus the registries and supervised
/// tasks of the communication layer.
pub struct P2pNode {
    endpoint: Endpoint,
    router: Router,
    metrics: Arc<BandwidthMetrics>,
    peers: Arc<PeerTable>,
    sessions: Arc<SessionTable>,
    streams: Arc<StreamTable>,
    queue_tx: mpsc::Sender<Inbound>,
    incoming_rx: std::sync::Mutex<Option<mpsc::Receiver<Arc<Session>>>>,
    cancel: CancellationToken,
    discovery_task: JoinHandle<()>,
    dispatcher_task: JoinHandle<()>,
    /// Keeps the dial to the bootstrap peer alive for the node's lifetime.
    bootstrap_conn: Option<Connection>,
}

impl P2pNode {
    /// Start a bootstrap node: bind, join the overlay, start the inbound
    /// protocol handler and the discovery loop. Dials nobody.
    pub async fn bootstrap(
        config: NodeConfig,
        rendezvous: Arc<dyn Rendezvous>,
        metrics: Arc<BandwidthMetrics>,
    ) -> Result<Self, Error> {
        let node = Self::new_host(&config, rendezvous, metrics).await?;
        info!(id = %node.id(), "bootstrap node ready");
        Ok(node)
    }

    /// Start a node that joins an existing overlay through `bootstrap`.
    /// The initial dial is fatal on failure; no retry at this layer.
    pub async fn join(
        config: NodeConfig,
        bootstrap: EndpointAddr,
        rendezvous: Arc<dyn Rendezvous>,
        metrics: Arc<BandwidthMetrics>,
    ) -> Result<Self, Error> {
        let mut node = Self::new_host(&config, rendezvous, metrics).await?;
        let conn = node
            .endpoint
            .connect(bootstrap, VIEW_ALPN)
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        node.bootstrap_conn = Some(conn);
        info!(id = %node.id(), "node joined overlay");
        Ok(node)
    }

    async fn new_host(
        config: &NodeConfig,
        rendezvous: Arc<dyn Rendezvous>,
        metrics: Arc<BandwidthMetrics>,
    ) -> Result<Self, Error> {
        let listen: SocketAddr = config
            .listen_addr
            .parse()
            .map_err(|e| Error::Config(format!("listen address {:?}: {e}", config.listen_addr)))?;
        let key = config.key.resolve()?;

        let mut builder = Endpoint::builder()
            .secret_key(key)
            .alpns(vec![VIEW_ALPN.to_vec()]);
        builder = match listen {
            SocketAddr::V4(v4) => builder.bind_addr_v4(v4),
            SocketAddr::V6(v6) => builder.bind_addr_v6(v6),
        };
        let endpoint = builder
            .bind()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        let local_endpoint = endpoint.id().to_string();
        let local_pkid = endpoint.id().as_bytes().to_vec();

        let cancel = CancellationToken::new();
        let peers = Arc::new(PeerTable::new());
        let sessions = Arc::new(SessionTable::default());
        let streams = Arc::new(StreamTable::default());
        let (queue_tx, queue_rx) = mpsc::channel(DISPATCH_QUEUE);
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_SESSIONS);

        let handler = ViewProtocol {
            queue: queue_tx.clone(),
            streams: streams.clone(),
            metrics: metrics.clone(),
            cancel: cancel.clone(),
        };
        let router = Router::builder(endpoint.clone())
            .accept(VIEW_ALPN, handler)
            .spawn();

        let dispatcher = Dispatcher {
            sessions: sessions.clone(),
            incoming_tx,
            local_endpoint: local_endpoint.clone(),
            local_pkid: local_pkid.clone(),
            metrics: metrics.clone(),
            cancel: cancel.clone(),
        };
        let dispatcher_task = tokio::spawn(dispatcher.run(queue_rx));

        let engine = DiscoveryEngine {
            rendezvous,
            config: config.discovery.clone(),
            self_id: local_endpoint.clone(),
            self_record: PeerRecord {
                peer_id: local_endpoint,
                addr: endpoint.addr(),
            },
            peers: peers.clone(),
            cancel: cancel.clone(),
        };
        // The loop's first iteration announces immediately; advertise
        // failures are logged, not fatal.
        let discovery_task = tokio::spawn(engine.run());

        Ok(Self {
            endpoint,
            router,
            metrics,
            peers,
            sessions,
            streams,
            queue_tx,
            incoming_rx: std::sync::Mutex::new(Some(incoming_rx)),
            cancel,
            discovery_task,
            dispatcher_task,
            bootstrap_conn: None,
        })
    }

    /// This node's identifier, derived deterministically from its key.
    pub fn id(&self) -> EndpointId {
        self.endpoint.id()
    }

    /// The node's address info, for sharing with peers out of band.
    pub fn addr(&self) -> EndpointAddr {
        self.endpoint.addr()
    }

    /// Snapshot of the discovered peers.
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.peers.snapshot()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn has_peer(&self, peer_id: &str) -> bool {
        self.peers.contains(peer_id)
    }

    /// Byte counters, for an external metrics sink to poll.
    pub fn metrics(&self) -> Arc<BandwidthMetrics> {
        self.metrics.clone()
    }

    /// Whether this node was constructed by joining a bootstrap peer.
    pub fn is_joined(&self) -> bool {
        self.bootstrap_conn.is_some()
    }

    /// Look up an existing session by its key.
    pub fn session(&self, session_id: &str, context_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(&SessionKey {
            session_id: session_id.to_string(),
            context_id: context_id.to_string(),
        })
    }

    /// Sessions created by the dispatcher on first inbound message.
    /// Takable once; returns `None` on later calls.
    pub fn take_incoming(&self) -> Option<mpsc::Receiver<Arc<Session>>> {
        self.incoming_rx.lock().unwrap().take()
    }

    /// Obtain a session to `target`. If the target is this node, a
    /// loopback session is returned with no network I/O; otherwise a
    /// network-stream session is opened and registered so replies route
    /// back by (SessionID, ContextID).
    pub async fn open_session(
        &self,
        target: EndpointAddr,
        context_id: &str,
        caller: &str,
    ) -> Result<Arc<Session>, Error> {
        if target.id == self.endpoint.id() {
            debug!(context_id, caller, "loopback session");
            let session = LoopbackSession::new(
                context_id,
                caller,
                &self.endpoint.id().to_string(),
                self.endpoint.id().as_bytes().to_vec(),
            );
            return Ok(Arc::new(Session::Loopback(session)));
        }

        let remote_id = target.id.to_string();
        let remote_pkid = target.id.as_bytes().to_vec();
        let conn = self
            .endpoint
            .connect(target, VIEW_ALPN)
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        let (send, mut recv) = conn
            .open_bi()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        let stream = Arc::new(tokio::sync::Mutex::new(send));

        let session_id = random_session_id();
        let (session, deliver) = NetworkSession::new(
            session_id.clone(),
            context_id.to_string(),
            caller.to_string(),
            remote_id.clone(),
            remote_pkid,
            stream.clone(),
            self.endpoint.id().to_string(),
            self.endpoint.id().as_bytes().to_vec(),
            self.metrics.clone(),
        );
        let session = Arc::new(Session::Network(session));
        self.sessions.insert(
            SessionKey {
                session_id: session_id.clone(),
                context_id: context_id.to_string(),
            },
            SessionEntry {
                deliver,
                session: session.clone(),
            },
        );

        // Reader feeding the dispatch queue so inbound traffic on this
        // stream routes through the same session table.
        let queue = self.queue_tx.clone();
        let metrics = self.metrics.clone();
        let reader_cancel = self.cancel.child_token();
        let task_cancel = reader_cancel.clone();
        let reply = stream.clone();
        let task = tokio::spawn(async move {
            // The connection lives as long as its reader.
            let _conn = conn;
            loop {
                let msg = tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    res = wire::read_msg(&mut recv, &metrics) => match res {
                        Ok(m) => m,
                        Err(_) => break,
                    },
                };
                if queue
                    .send(Inbound {
                        message: msg,
                        reply: reply.clone(),
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        self.streams.register(
            &remote_id,
            StreamHandler {
                cancel: reader_cancel,
                task: Some(task),
            },
        );

        debug!(session_id, context_id, peer = %remote_id, "network session opened");
        Ok(session)
    }

    /// Cancel and join every stream reader serving `peer_id`. Inbound
    /// traffic from that peer stops until it opens a new stream; existing
    /// sessions keep their send half.
    pub async fn close_peer_streams(&self, peer_id: &str) {
        for handler in self.streams.remove_peer(peer_id) {
            handler.cancel.cancel();
            if let Some(task) = handler.task {
                let _ = task.await;
            }
        }
        debug!(peer = %peer_id, "peer streams closed");
    }

    /// Stop all background tasks and release the endpoint. Discovery
    /// observes cancellation within one sleep cycle.
    pub async fn shutdown(self) -> Result<(), Error> {
        self.cancel.cancel();

        if self.discovery_task.await.is_err() {
            warn!("discovery task panicked");
        }
        if self.dispatcher_task.await.is_err() {
            warn!("dispatcher task panicked");
        }
        for handler in self.streams.drain() {
            handler.cancel.cancel();
            if let Some(task) = handler.task {
                let _ = task.await;
            }
        }

        self.router
            .shutdown()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        self.endpoint.close().await;
        debug!("node shut down");
        Ok(())
    }
}
