use thiserror::Error;

use crate::utils::NodeId;

#[derive(Debug, Error)]
pub enum ConcordError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Consensus error: {0}")]
    Consensus(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid config: {0}")]
    Config(String),

    #[error("Threshold {0} outside [0.5, 1.0]")]
    InvalidThreshold(f64),

    #[error("Member weight must be positive (got {0})")]
    InvalidWeight(u64),

    #[error("Missing required identifier: {0}")]
    MissingIdentifier(&'static str),

    #[error("Unknown member: {0}")]
    UnknownMember(NodeId),

    #[error("Unknown voting round: {0}")]
    UnknownRound(String),

    #[error("Not the leader (current leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other: {0}")]
    Other(String),
}

impl From<serde_json::Error> for ConcordError {
    fn from(e: serde_json::Error) -> Self {
        ConcordError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for ConcordError {
    fn from(e: bincode::Error) -> Self {
        ConcordError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConcordError>;
