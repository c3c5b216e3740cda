use serde::{Deserialize, Serialize};

use crate::env::consensus::types::{RoundId, Vote};
use crate::utils::NodeId;

/// Proof that a member cast two different decisions in the same voting round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquivocationEvidence {
    pub offender: NodeId,
    pub round_id: RoundId,
    pub vote_a: Vote,
    pub vote_b: Vote,
}

impl EquivocationEvidence {
    pub fn offender(&self) -> &NodeId {
        &self.offender
    }
}
