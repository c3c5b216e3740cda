use serde::{Deserialize, Serialize};

use crate::{
    env::consensus::types::{RoundId, Vote},
    utils::NodeId,
};

/// A single member's decision in a voting round, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteData {
    pub round_id: RoundId,
    pub voter: NodeId,
    pub vote: Vote,
}

impl VoteData {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
