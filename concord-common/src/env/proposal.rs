use serde::{Deserialize, Serialize};

use crate::env::consensus::types::RoundId;
use crate::utils::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    Add,
    Remove,
    UpdateWeight,
}

/// A structural change to the cluster. Always resolved through a vote
/// before it touches the membership registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipChange {
    pub change_type: ChangeType,
    pub target: NodeId,
    pub new_weight: Option<u64>,
    pub proposer: NodeId,
    #[serde(default)]
    pub approved: bool,
}

impl MembershipChange {
    pub fn add(target: NodeId, weight: u64, proposer: NodeId) -> Self {
        Self {
            change_type: ChangeType::Add,
            target,
            new_weight: Some(weight),
            proposer,
            approved: false,
        }
    }

    pub fn remove(target: NodeId, proposer: NodeId) -> Self {
        Self {
            change_type: ChangeType::Remove,
            target,
            new_weight: None,
            proposer,
            approved: false,
        }
    }

    pub fn update_weight(target: NodeId, weight: u64, proposer: NodeId) -> Self {
        Self {
            change_type: ChangeType::UpdateWeight,
            target,
            new_weight: Some(weight),
            proposer,
            approved: false,
        }
    }
}

/// What a voting round decides on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProposalKind {
    /// Opaque payload supplied by a calling agent.
    Decision(Vec<u8>),
    MembershipChange(MembershipChange),
    ThresholdChange { threshold: f64 },
}

impl ProposalKind {
    /// Structural proposals must be approved by a supermajority.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ProposalKind::MembershipChange(_) | ProposalKind::ThresholdChange { .. }
        )
    }
}

/// A proposal submitted for a weighted vote.
///
/// Each proposal is authored by a node and uniquely identified by its round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: RoundId,

    pub proposer: NodeId,

    pub kind: ProposalKind,

    /// Approval fraction of the active weight, in [0.5, 1.0].
    pub threshold: f64,

    /// How long the round stays open.
    pub timeout_ms: u64,
}

impl Proposal {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_kinds() {
        let change = MembershipChange::add(NodeId::from("n4"), 1, NodeId::from("n1"));
        assert!(ProposalKind::MembershipChange(change).is_structural());
        assert!(ProposalKind::ThresholdChange { threshold: 0.8 }.is_structural());
        assert!(!ProposalKind::Decision(b"deploy".to_vec()).is_structural());
    }

    #[test]
    fn proposal_json_keeps_kind() {
        let proposal = Proposal {
            id: RoundId::generate(),
            proposer: NodeId::from("n1"),
            kind: ProposalKind::Decision(vec![1, 2, 3]),
            threshold: 0.67,
            timeout_ms: 1_000,
        };
        let json = proposal.to_json().unwrap();
        assert_eq!(Proposal::from_json(&json).unwrap(), proposal);
    }
}
