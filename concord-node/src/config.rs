use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use concord_common::{ConcordError, ConsensusConfig, NodeId, Result};

/// A bootstrap member of the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberConfig {
    pub id: NodeId,
    #[serde(default = "default_weight")]
    pub weight: u64,
}

fn default_weight() -> u64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node_id: NodeId,
    #[serde(default = "default_weight")]
    pub weight: u64,
    /// Where Raft state is persisted. In-memory storage when absent.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub members: Vec<MemberConfig>,
    #[serde(default)]
    pub consensus: ConsensusConfig,
}

impl Config {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            members: vec![MemberConfig {
                id: node_id.clone(),
                weight: default_weight(),
            }],
            node_id,
            weight: default_weight(),
            data_dir: None,
            consensus: ConsensusConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(ConcordError::MissingIdentifier("node_id"));
        }
        if self.weight == 0 {
            return Err(ConcordError::InvalidWeight(0));
        }
        if let Some(member) = self.members.iter().find(|m| m.id.is_empty()) {
            return Err(ConcordError::Config(format!(
                "member entry with empty id (weight {})",
                member.weight
            )));
        }
        self.consensus.validate()
    }

    /// Bootstrap members, always including the local node with its own weight.
    pub fn cluster_members(&self) -> Vec<(NodeId, u64)> {
        let mut members: Vec<(NodeId, u64)> = self
            .members
            .iter()
            .filter(|m| m.id != self.node_id)
            .map(|m| (m.id.clone(), m.weight))
            .collect();
        members.push((self.node_id.clone(), self.weight));
        members.sort();
        members
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}
