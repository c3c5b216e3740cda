use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use concord_common::{
    env::{consensus::evidence::EquivocationEvidence, Proposal, RoundId, RoundStatus, Vote},
    NodeId,
};

use super::evaluator::QuorumConfiguration;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ballot {
    pub vote: Vote,
    pub weight: u64,
}

pub(crate) enum BallotOutcome {
    Counted,
    Duplicate,
    Conflict(EquivocationEvidence),
}

/// A weighted vote over one proposal.
///
/// The electorate and its weights are frozen when the round opens, so the
/// tally can never exceed `total_weight`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VotingRound {
    pub id: RoundId,
    pub proposal: Proposal,
    pub electorate: BTreeMap<NodeId, u64>,
    pub votes: BTreeMap<NodeId, Ballot>,
    pub total_weight: u64,
    pub required_weight: u64,
    /// Sum of `yes` weight.
    pub current_weight: u64,
    pub no_weight: u64,
    pub abstain_weight: u64,
    pub opened_at_ms: u64,
    pub deadline_ms: u64,
    pub status: RoundStatus,
    pub resolved_at_ms: Option<u64>,
}

/// Read-only digest of a round for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundSummary {
    pub id: RoundId,
    pub status: RoundStatus,
    pub yes_weight: u64,
    pub no_weight: u64,
    pub abstain_weight: u64,
    pub required_weight: u64,
    pub total_weight: u64,
    pub participation: f64,
}

impl VotingRound {
    pub(crate) fn open(proposal: Proposal, quorum: &QuorumConfiguration, now_ms: u64) -> Self {
        let electorate = quorum.members.iter().cloned().collect();
        Self {
            id: proposal.id,
            deadline_ms: now_ms.saturating_add(proposal.timeout_ms),
            proposal,
            electorate,
            votes: BTreeMap::new(),
            total_weight: quorum.total_weight,
            required_weight: quorum.required_weight.max(1),
            current_weight: 0,
            no_weight: 0,
            abstain_weight: 0,
            opened_at_ms: now_ms,
            status: RoundStatus::Active,
            resolved_at_ms: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == RoundStatus::Active
    }

    pub fn weight_of(&self, member: &NodeId) -> Option<u64> {
        self.electorate.get(member).copied()
    }

    pub(crate) fn record(&mut self, member: &NodeId, vote: Vote, weight: u64) -> BallotOutcome {
        if let Some(existing) = self.votes.get(member) {
            if existing.vote == vote {
                return BallotOutcome::Duplicate;
            }
            return BallotOutcome::Conflict(EquivocationEvidence {
                offender: member.clone(),
                round_id: self.id,
                vote_a: existing.vote,
                vote_b: vote,
            });
        }

        self.votes.insert(member.clone(), Ballot { vote, weight });
        match vote {
            Vote::Yes => self.current_weight += weight,
            Vote::No => self.no_weight += weight,
            Vote::Abstain => self.abstain_weight += weight,
        }
        BallotOutcome::Counted
    }

    pub fn counted_weight(&self) -> u64 {
        self.current_weight + self.no_weight + self.abstain_weight
    }

    /// Weight of electorate members that have not voted yet.
    pub fn outstanding_weight(&self) -> u64 {
        self.total_weight.saturating_sub(self.counted_weight())
    }

    pub fn has_passed(&self) -> bool {
        self.current_weight >= self.required_weight
    }

    /// No remaining vote can lift the round to the required weight.
    pub fn is_decided_negative(&self) -> bool {
        self.current_weight + self.outstanding_weight() < self.required_weight
    }

    pub(crate) fn close(&mut self, status: RoundStatus, now_ms: u64) -> bool {
        if !self.is_active() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.resolved_at_ms = Some(now_ms);
        true
    }

    pub fn summary(&self) -> RoundSummary {
        let participation = if self.total_weight == 0 {
            0.0
        } else {
            self.counted_weight() as f64 / self.total_weight as f64
        };
        RoundSummary {
            id: self.id,
            status: self.status,
            yes_weight: self.current_weight,
            no_weight: self.no_weight,
            abstain_weight: self.abstain_weight,
            required_weight: self.required_weight,
            total_weight: self.total_weight,
            participation,
        }
    }
}
