//! In-process clusters over the simulated network.
//!
//! Used by the `simulate` subcommand and by the integration tests.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use concord_common::{
    env::{LogIndex, Term},
    ConcordError, ConsensusConfig, NodeId, Result,
};
use concord_consensus::{raft::AppliedLog, Role};
use concord_p2p::{in_memory::NetworkStats, InMemoryNetwork};

use crate::config::{Config, MemberConfig};
use crate::runtime::{
    build_runtime, open_store, ApproveAll, HealthReport, MaestroHandle, RejectAll, VotePolicy,
};

const SUBMIT_ATTEMPTS: usize = 50;
const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct SimNode {
    pub id: NodeId,
    pub handle: MaestroHandle,
    pub applied: AppliedLog,
    pub task: JoinHandle<Result<()>>,
}

pub struct SimCluster {
    pub network: InMemoryNetwork,
    pub nodes: Vec<SimNode>,
}

/// Per-cluster knobs beyond membership and consensus settings.
#[derive(Debug, Clone, Default)]
pub struct SimOptions {
    /// Persist each node under `<data_dir>/<node_id>` instead of in memory.
    pub data_dir: Option<PathBuf>,
    /// Nodes that vote no on every proposal they did not make.
    pub dissenters: BTreeSet<NodeId>,
}

fn unit_members(count: usize) -> Vec<(NodeId, u64)> {
    (1..=count)
        .map(|i| (NodeId::from(format!("n{}", i)), 1))
        .collect()
}

impl SimCluster {
    /// Spawns `count` unit-weight nodes named `n1..=n{count}`.
    pub async fn spawn(count: usize, consensus: ConsensusConfig) -> Result<Self> {
        Self::spawn_with(&unit_members(count), consensus, SimOptions::default()).await
    }

    pub async fn spawn_weighted(members: &[(NodeId, u64)], consensus: ConsensusConfig) -> Result<Self> {
        Self::spawn_with(members, consensus, SimOptions::default()).await
    }

    pub async fn spawn_with(
        members: &[(NodeId, u64)],
        consensus: ConsensusConfig,
        options: SimOptions,
    ) -> Result<Self> {
        let network = InMemoryNetwork::new();
        let member_configs: Vec<MemberConfig> = members
            .iter()
            .map(|(id, weight)| MemberConfig { id: id.clone(), weight: *weight })
            .collect();

        let mut nodes = Vec::with_capacity(members.len());
        for (id, weight) in members {
            let config = Config {
                node_id: id.clone(),
                weight: *weight,
                data_dir: options.data_dir.clone(),
                members: member_configs.clone(),
                consensus: consensus.clone(),
            };
            let policy: Box<dyn VotePolicy> = if options.dissenters.contains(id) {
                Box::new(RejectAll)
            } else {
                Box::new(ApproveAll)
            };
            let (transport, inbox) = network.register(id.clone()).await;
            let applied = AppliedLog::new();
            let runtime = build_runtime(
                &config,
                transport,
                inbox,
                open_store(&config)?,
                Box::new(applied.clone()),
                policy,
            )?;
            nodes.push(SimNode {
                id: id.clone(),
                handle: runtime.handle,
                applied,
                task: runtime.task,
            });
        }
        info!("🧪 Simulated cluster of {} nodes up", nodes.len());
        Ok(Self { network, nodes })
    }

    pub fn node(&self, id: &NodeId) -> Option<&SimNode> {
        self.nodes.iter().find(|n| n.id == *id)
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id.clone()).collect()
    }

    /// Health reports of every node still running.
    pub async fn statuses(&self) -> Vec<HealthReport> {
        let mut reports = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if let Ok(report) = node.handle.status().await {
                reports.push(report);
            }
        }
        reports
    }

    /// The leader of the highest term currently seen, if any.
    pub async fn leader(&self) -> Option<(NodeId, Term)> {
        self.statuses()
            .await
            .into_iter()
            .filter(|r| r.role == Role::Leader)
            .max_by_key(|r| r.term)
            .map(|r| (r.node_id, r.term))
    }

    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if let Some((leader, _)) = self.leader().await {
                return Some(leader);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        None
    }

    /// Submits to whichever node currently leads, following `NotLeader` hints.
    pub async fn submit(&self, command: Vec<u8>) -> Result<LogIndex> {
        let mut hint: Option<NodeId> = None;
        for _ in 0..SUBMIT_ATTEMPTS {
            let target = match hint.take() {
                Some(id) => Some(id),
                None => self.leader().await.map(|(id, _)| id),
            };
            let Some(node) = target.as_ref().and_then(|id| self.node(id)) else {
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            };
            match node.handle.submit_command(command.clone()).await {
                Ok(index) => return Ok(index),
                Err(ConcordError::NotLeader { leader }) => {
                    hint = leader;
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(ConcordError::NotLeader { leader: None })
    }

    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.handle.shutdown().await;
        }
        for node in self.nodes {
            if let Ok(Err(e)) = node.task.await {
                warn!("Node {} stopped with error: {}", node.id, e);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Cluster size when `members` is empty.
    pub nodes: usize,
    /// Explicit weighted membership, taken from a config file.
    pub members: Vec<(NodeId, u64)>,
    pub data_dir: Option<PathBuf>,
    pub commands: usize,
    pub duration: Duration,
    pub consensus: ConsensusConfig,
    pub latency_max_ms: u64,
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            nodes: 5,
            members: Vec::new(),
            data_dir: None,
            commands: 10,
            duration: Duration::from_millis(3000),
            consensus: ConsensusConfig::default(),
            latency_max_ms: 0,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub id: NodeId,
    pub role: Role,
    pub term: Term,
    pub commit_index: LogIndex,
    pub applied: usize,
    pub active_members: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub leader: Option<NodeId>,
    pub submitted: usize,
    pub nodes: Vec<NodeSummary>,
    pub delivered: u64,
    pub dropped: u64,
}

/// Boots a cluster, waits for a leader, replicates the requested number of
/// commands and reports where every node ended up.
pub async fn run_simulation(sim: SimulationConfig) -> Result<SimulationReport> {
    let members = if sim.members.is_empty() {
        unit_members(sim.nodes)
    } else {
        sim.members.clone()
    };
    if members.is_empty() {
        return Err(ConcordError::Config("simulation needs at least one node".into()));
    }
    let mut consensus = sim.consensus.clone();
    if sim.seed.is_some() {
        consensus.rng_seed = sim.seed;
    }

    let options = SimOptions {
        data_dir: sim.data_dir.clone(),
        ..SimOptions::default()
    };
    let cluster = SimCluster::spawn_with(&members, consensus, options).await?;
    if sim.latency_max_ms > 0 {
        cluster.network.set_latency(0, sim.latency_max_ms).await;
    }

    let leader = cluster.wait_for_leader(sim.duration).await;
    let mut submitted = 0;
    if leader.is_some() {
        for i in 0..sim.commands {
            match cluster.submit(format!("cmd-{}", i).into_bytes()).await {
                Ok(index) => {
                    submitted += 1;
                    info!(target: "consensus", "EVENT:SUBMIT index={} command=cmd-{}", index, i);
                }
                Err(e) => warn!("Command {} not accepted: {}", i, e),
            }
        }
    } else {
        warn!("No leader elected within {:?}", sim.duration);
    }

    tokio::time::sleep(sim.duration).await;

    let reports = cluster.statuses().await;
    let nodes = cluster
        .nodes
        .iter()
        .filter_map(|node| {
            let report = reports.iter().find(|r| r.node_id == node.id)?;
            Some(NodeSummary {
                id: node.id.clone(),
                role: report.role,
                term: report.term,
                commit_index: report.commit_index,
                applied: node.applied.len(),
                active_members: report.active_members,
            })
        })
        .collect();
    let stats: NetworkStats = cluster.network.stats().await;
    let leader = cluster.leader().await.map(|(id, _)| id);
    cluster.shutdown().await;

    Ok(SimulationReport {
        leader,
        submitted,
        nodes,
        delivered: stats.delivered,
        dropped: stats.dropped,
    })
}
