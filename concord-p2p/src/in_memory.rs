//! In-process cluster network.
//!
//! Every message goes through the binary codec, may be delayed by a random
//! latency, dropped at a configured rate, or blocked by a partition. Used by
//! the simulation binary and the integration tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};

use concord_common::NodeId;

use crate::codec::{decode_envelope, encode_envelope};
use crate::message::{ClusterMessage, Envelope, NetworkError};
use crate::ports::Transport;

pub const INBOX_CAPACITY: usize = 1024;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStats {
    pub delivered: u64,
    pub dropped: u64,
    pub blocked: u64,
}

#[derive(Default)]
struct Hub {
    inboxes: HashMap<NodeId, mpsc::Sender<Envelope>>,
    blocked: HashSet<(NodeId, NodeId)>,
    latency_ms: Option<(u64, u64)>,
    drop_rate: f64,
    stats: NetworkStats,
}

#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    hub: Arc<RwLock<Hub>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a node, returning its transport and inbox.
    pub async fn register(&self, id: NodeId) -> (InMemoryTransport, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.hub.write().await.inboxes.insert(id.clone(), tx);
        let transport = InMemoryTransport {
            id,
            network: self.clone(),
        };
        (transport, rx)
    }

    /// Detaches a node; messages addressed to it are dropped from now on.
    pub async fn unregister(&self, id: &NodeId) {
        self.hub.write().await.inboxes.remove(id);
    }

    /// Splits the cluster: links between nodes of different groups are cut.
    pub async fn partition(&self, groups: &[Vec<NodeId>]) {
        let mut hub = self.hub.write().await;
        for (i, left) in groups.iter().enumerate() {
            for right in groups.iter().skip(i + 1) {
                for a in left {
                    for b in right {
                        hub.blocked.insert((a.clone(), b.clone()));
                        hub.blocked.insert((b.clone(), a.clone()));
                    }
                }
            }
        }
        debug!("Network partitioned into {} groups", groups.len());
    }

    /// Cuts every link to and from `id`.
    pub async fn disconnect(&self, id: &NodeId) {
        let mut hub = self.hub.write().await;
        let others: Vec<NodeId> = hub.inboxes.keys().filter(|k| *k != id).cloned().collect();
        for other in others {
            hub.blocked.insert((id.clone(), other.clone()));
            hub.blocked.insert((other, id.clone()));
        }
    }

    pub async fn heal(&self) {
        self.hub.write().await.blocked.clear();
        debug!("Network healed");
    }

    pub async fn set_latency(&self, min_ms: u64, max_ms: u64) {
        self.hub.write().await.latency_ms = Some((min_ms.min(max_ms), max_ms.max(min_ms)));
    }

    pub async fn set_drop_rate(&self, rate: f64) {
        self.hub.write().await.drop_rate = rate.clamp(0.0, 1.0);
    }

    pub async fn stats(&self) -> NetworkStats {
        self.hub.read().await.stats
    }

    pub async fn members(&self) -> Vec<NodeId> {
        self.hub.read().await.inboxes.keys().cloned().collect()
    }

    async fn deliver(&self, from: &NodeId, to: &NodeId, bytes: Vec<u8>) -> Result<(), NetworkError> {
        let (inbox, delay) = {
            let mut hub = self.hub.write().await;
            if hub.blocked.contains(&(from.clone(), to.clone())) {
                hub.stats.blocked += 1;
                return Ok(());
            }
            let Some(inbox) = hub.inboxes.get(to).cloned() else {
                return Err(NetworkError::PeerNotFound(to.to_string()));
            };
            let mut rng = rand::thread_rng();
            if hub.drop_rate > 0.0 && rng.gen::<f64>() < hub.drop_rate {
                hub.stats.dropped += 1;
                return Ok(());
            }
            let delay = hub.latency_ms.map(|(lo, hi)| rng.gen_range(lo..=hi));
            hub.stats.delivered += 1;
            (inbox, delay)
        };

        let envelope = decode_envelope(&bytes)?;
        match delay {
            Some(ms) if ms > 0 => {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    let _ = inbox.try_send(envelope);
                });
            }
            _ => {
                if inbox.try_send(envelope).is_err() {
                    trace!("Inbox of {} full or closed, message dropped", to);
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct InMemoryTransport {
    id: NodeId,
    network: InMemoryNetwork,
}

impl InMemoryTransport {
    pub fn network(&self) -> &InMemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn local_id(&self) -> &NodeId {
        &self.id
    }

    async fn broadcast(&self, message: ClusterMessage) -> Result<(), NetworkError> {
        let bytes = encode_envelope(&Envelope::new(self.id.clone(), message))?;
        let peers: Vec<NodeId> = self
            .network
            .members()
            .await
            .into_iter()
            .filter(|p| *p != self.id)
            .collect();
        for peer in peers {
            // a peer leaving mid-broadcast is not an error for the others
            let _ = self.network.deliver(&self.id, &peer, bytes.clone()).await;
        }
        Ok(())
    }

    async fn send(&self, to: &NodeId, message: ClusterMessage) -> Result<(), NetworkError> {
        let bytes = encode_envelope(&Envelope::new(self.id.clone(), message))?;
        self.network.deliver(&self.id, to, bytes).await
    }
}
