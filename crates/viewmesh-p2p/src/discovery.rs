//! Rendezvous-based peer discovery.
//!
//! The overlay's routing/DHT internals are an external capability,
//! consumed through exactly two operations: advertise at a rendezvous
//! topic, and find the peers currently advertised there. The discovery
//! engine runs a perpetual advertise → search → sleep loop that feeds
//! the peer table until it is cancelled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use iroh::EndpointAddr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;

/// A peer sighted at the rendezvous point.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: String,
    pub addr: EndpointAddr,
}

/// Advertise/find capability provided by the surrounding platform.
#[async_trait]
pub trait Rendezvous: Send + Sync + std::fmt::Debug + 'static {
    /// Announce `record` at the shared rendezvous `topic`.
    async fn advertise(&self, topic: &str, record: PeerRecord) -> Result<(), Error>;

    /// Lazy sequence of the peers currently advertised at `topic`.
    async fn find_peers(&self, topic: &str) -> Result<mpsc::Receiver<PeerRecord>, Error>;
}

/// In-process rendezvous point. Nodes sharing one instance (same-process
/// clusters, tests) find each other through it.
#[derive(Debug, Default)]
pub struct MemoryRendezvous {
    topics: Mutex<HashMap<String, Vec<PeerRecord>>>,
}

impl MemoryRendezvous {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Rendezvous for MemoryRendezvous {
    async fn advertise(&self, topic: &str, record: PeerRecord) -> Result<(), Error> {
        let mut topics = self.topics.lock().unwrap();
        let entries = topics.entry(topic.to_string()).or_default();
        if let Some(existing) = entries.iter_mut().find(|r| r.peer_id == record.peer_id) {
            existing.addr = record.addr;
        } else {
            entries.push(record);
        }
        Ok(())
    }

    async fn find_peers(&self, topic: &str) -> Result<mpsc::Receiver<PeerRecord>, Error> {
        let records = self
            .topics
            .lock()
            .unwrap()
            .get(topic)
            .cloned()
            .unwrap_or_default();
        let (tx, rx) = mpsc::channel(records.len().max(1));
        tokio::spawn(async move {
            for record in records {
                if tx.send(record).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// Peer table
// ---------------------------------------------------------------------------

/// Known peers, keyed by peer identifier. First discovery wins; records
/// are never refreshed or expired by this layer. Never contains the
/// owning node's own identifier.
#[derive(Debug, Default)]
pub struct PeerTable {
    inner: Mutex<HashMap<String, PeerRecord>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `record` unless the peer is already known. Returns whether
    /// the record was inserted.
    pub fn insert_if_absent(&self, record: PeerRecord) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.contains_key(&record.peer_id) {
            return false;
        }
        inner.insert(record.peer_id.clone(), record);
        true
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.inner.lock().unwrap().contains_key(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerRecord> {
        self.inner.lock().unwrap().get(peer_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Discovery engine
// ---------------------------------------------------------------------------

/// Tuning for the discovery loop. The sleep between cycles is broken
/// into `polls_per_cycle` sub-intervals of `poll_interval`, with the
/// cancellation token checked between each, so shutdown latency is
/// bounded by one full cycle.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Shared rendezvous topic peers use to find one another.
    pub topic: String,
    pub poll_interval: Duration,
    pub polls_per_cycle: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            topic: "viewmesh-rendezvous".to_string(),
            poll_interval: Duration::from_millis(500),
            polls_per_cycle: 4,
        }
    }
}

impl DiscoveryConfig {
    /// Worst-case shutdown latency of the loop.
    pub fn cycle(&self) -> Duration {
        self.poll_interval * self.polls_per_cycle
    }
}

/// The advertise → search → sleep loop feeding one node's peer table.
pub(crate) struct DiscoveryEngine {
    pub rendezvous: Arc<dyn Rendezvous>,
    pub config: DiscoveryConfig,
    pub self_id: String,
    pub self_record: PeerRecord,
    pub peers: Arc<PeerTable>,
    pub cancel: CancellationToken,
}

impl DiscoveryEngine {
    /// Announce once. With `strict` the failure propagates (used at
    /// startup when the caller wants a hard failure); otherwise it is
    /// logged and swallowed.
    pub(crate) async fn advertise_once(&self, strict: bool) -> Result<(), Error> {
        match self
            .rendezvous
            .advertise(&self.config.topic, self.self_record.clone())
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if strict => Err(Error::Advertise(e.to_string())),
            Err(e) => {
                warn!("rendezvous advertise failed: {e}");
                Ok(())
            }
        }
    }

    /// Perpetual loop. Terminates only on cancellation and cannot be
    /// restarted afterwards.
    pub(crate) async fn run(self) {
        loop {
            // Advertise: non-fatal in steady state.
            let _ = self.advertise_once(false).await;

            // Search: skip self, first discovery wins.
            match self.rendezvous.find_peers(&self.config.topic).await {
                Ok(mut found) => {
                    while let Some(record) = found.recv().await {
                        if record.peer_id == self.self_id {
                            continue;
                        }
                        if self.peers.insert_if_absent(record.clone()) {
                            debug!(peer = %record.peer_id, "discovered peer");
                        }
                    }
                }
                Err(e) => warn!("rendezvous search failed: {e}"),
            }

            // Sleep in sub-intervals, observing cancellation between each.
            for _ in 0..self.config.polls_per_cycle {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        debug!("discovery loop stopped");
                        return;
                    }
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iroh::SecretKey;

    fn record(id: &str) -> PeerRecord {
        let key = SecretKey::generate(&mut rand::rng());
        PeerRecord {
            peer_id: id.to_string(),
            addr: EndpointAddr::from(key.public()),
        }
    }

    #[derive(Debug)]
    struct FailingRendezvous;

    #[async_trait]
    impl Rendezvous for FailingRendezvous {
        async fn advertise(&self, _topic: &str, _record: PeerRecord) -> Result<(), Error> {
            Err(Error::Advertise("rendezvous unreachable".into()))
        }

        async fn find_peers(&self, _topic: &str) -> Result<mpsc::Receiver<PeerRecord>, Error> {
            Err(Error::Discovery("rendezvous unreachable".into()))
        }
    }

    fn engine(rendezvous: Arc<dyn Rendezvous>, config: DiscoveryConfig) -> DiscoveryEngine {
        DiscoveryEngine {
            rendezvous,
            config,
            self_id: "self".to_string(),
            self_record: record("self"),
            peers: Arc::new(PeerTable::new()),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn first_discovery_wins() {
        let table = PeerTable::new();
        let first = record("peer-1");
        let first_addr = first.addr.clone();

        assert!(table.insert_if_absent(first));
        assert!(!table.insert_if_absent(record("peer-1")));

        assert_eq!(table.len(), 1);
        assert_eq!(table.get("peer-1").unwrap().addr, first_addr);
    }

    #[tokio::test]
    async fn memory_rendezvous_advertise_and_find() {
        let rendezvous = MemoryRendezvous::new();
        rendezvous.advertise("topic", record("a")).await.unwrap();
        rendezvous.advertise("topic", record("b")).await.unwrap();
        rendezvous.advertise("other", record("c")).await.unwrap();

        let mut found = rendezvous.find_peers("topic").await.unwrap();
        let mut ids = Vec::new();
        while let Some(r) = found.recv().await {
            ids.push(r.peer_id);
        }
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn strict_first_advertise_propagates() {
        let engine = engine(Arc::new(FailingRendezvous), DiscoveryConfig::default());
        let err = engine.advertise_once(true).await.unwrap_err();
        assert!(matches!(err, Error::Advertise(_)));
    }

    #[tokio::test]
    async fn non_strict_advertise_is_swallowed() {
        let engine = engine(Arc::new(FailingRendezvous), DiscoveryConfig::default());
        assert!(engine.advertise_once(false).await.is_ok());
    }

    #[tokio::test]
    async fn loop_fills_peer_table_and_skips_self() {
        let rendezvous = Arc::new(MemoryRendezvous::new());
        let config = DiscoveryConfig {
            poll_interval: Duration::from_millis(10),
            ..DiscoveryConfig::default()
        };
        rendezvous
            .advertise(&config.topic, record("other"))
            .await
            .unwrap();

        let engine = engine(rendezvous, config.clone());
        let peers = engine.peers.clone();
        let cancel = engine.cancel.clone();
        let task = tokio::spawn(engine.run());

        tokio::time::sleep(config.cycle()).await;
        assert!(peers.contains("other"));
        assert!(!peers.contains("self"));

        cancel.cancel();
        tokio::time::timeout(config.cycle() * 2, task)
            .await
            .expect("loop exits within one cycle")
            .expect("loop task");
    }

    #[tokio::test]
    async fn search_errors_do_not_kill_the_loop() {
        let config = DiscoveryConfig {
            poll_interval: Duration::from_millis(5),
            ..DiscoveryConfig::default()
        };
        let engine = engine(Arc::new(FailingRendezvous), config.clone());
        let cancel = engine.cancel.clone();
        let task = tokio::spawn(engine.run());

        // Several failing cycles later the loop is still alive.
        tokio::time::sleep(config.cycle() * 3).await;
        assert!(!task.is_finished());

        cancel.cancel();
        tokio::time::timeout(config.cycle() * 2, task)
            .await
            .expect("loop exits within one cycle")
            .expect("loop task");
    }
}
