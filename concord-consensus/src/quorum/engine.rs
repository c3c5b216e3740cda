use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info, warn};

use concord_common::{
    config::validate_threshold,
    env::{consensus::evidence::EquivocationEvidence, Proposal, RoundId, RoundStatus, Vote},
    ConcordError, NodeId, Result,
};
use concord_p2p::MembershipRegistry;

use super::evaluator::QuorumConfiguration;
use super::round::{BallotOutcome, RoundSummary, VotingRound};

/// Result of a single `cast_vote` call.
#[derive(Debug, Clone, PartialEq)]
pub enum CastOutcome {
    /// Counted; the round is still open.
    Recorded { yes_weight: u64 },
    /// Counted and the round reached its required weight.
    Passed,
    /// Same decision sent twice. Nothing changed.
    Duplicate,
    /// A second, different decision from the same member. The first one stands.
    Conflicting(EquivocationEvidence),
    Rejected(RejectReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    UnknownRound,
    RoundClosed(RoundStatus),
    NotInElectorate,
    NotEligible,
}

#[derive(Debug, Default)]
pub struct QuorumEngine {
    rounds: HashMap<RoundId, VotingRound>,
    deadlines: BTreeSet<(u64, RoundId)>,
}

impl QuorumEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a round over the currently eligible members.
    ///
    /// Opening a round id that already exists is a no-op and returns the id.
    pub fn initiate_vote(
        &mut self,
        proposal: Proposal,
        registry: &MembershipRegistry,
        now_ms: u64,
    ) -> Result<RoundId> {
        validate_threshold(proposal.threshold)?;
        if self.rounds.contains_key(&proposal.id) {
            return Ok(proposal.id);
        }

        let quorum = QuorumConfiguration::from_registry(registry, proposal.threshold)?;
        if quorum.total_weight == 0 {
            return Err(ConcordError::Consensus(
                "no eligible members to vote".to_string(),
            ));
        }

        let round = VotingRound::open(proposal, &quorum, now_ms);
        let id = round.id;
        info!(
            target: "consensus",
            "EVENT:PROPOSE id={} proposer={} required={} total={}",
            id, round.proposal.proposer, round.required_weight, round.total_weight
        );
        self.deadlines.insert((round.deadline_ms, id));
        self.rounds.insert(id, round);
        Ok(id)
    }

    /// Records `member`'s decision. Weight comes from the electorate frozen
    /// when the round opened, and the member must still be eligible now.
    pub fn cast_vote(
        &mut self,
        round_id: &RoundId,
        member: &NodeId,
        vote: Vote,
        registry: &MembershipRegistry,
        now_ms: u64,
    ) -> CastOutcome {
        let Some(round) = self.rounds.get_mut(round_id) else {
            debug!("Vote for unknown round {} from {}", round_id, member);
            return CastOutcome::Rejected(RejectReason::UnknownRound);
        };
        if !round.is_active() {
            return CastOutcome::Rejected(RejectReason::RoundClosed(round.status));
        }
        let Some(weight) = round.weight_of(member) else {
            return CastOutcome::Rejected(RejectReason::NotInElectorate);
        };
        if !registry.eligible(member) {
            return CastOutcome::Rejected(RejectReason::NotEligible);
        }

        match round.record(member, vote, weight) {
            BallotOutcome::Duplicate => CastOutcome::Duplicate,
            BallotOutcome::Conflict(evidence) => {
                warn!(
                    target: "consensus",
                    "EVENT:EQUIVOCATION round={} member={} first={} second={}",
                    round_id, member, evidence.vote_a, evidence.vote_b
                );
                CastOutcome::Conflicting(evidence)
            }
            BallotOutcome::Counted => {
                info!(
                    target: "consensus",
                    "EVENT:RECEIVE_VOTE round={} voter={} vote={} weight={}",
                    round_id, member, vote, weight
                );
                if round.has_passed() {
                    let deadline = round.deadline_ms;
                    round.close(RoundStatus::Passed, now_ms);
                    self.deadlines.remove(&(deadline, *round_id));
                    info!(target: "consensus", "EVENT:COMMIT id={} status=passed", round_id);
                    CastOutcome::Passed
                } else {
                    CastOutcome::Recorded {
                        yes_weight: round.current_weight,
                    }
                }
            }
        }
    }

    /// Moves a round to its terminal status. Calling it again returns the
    /// status decided the first time.
    pub fn resolve(&mut self, round_id: &RoundId, now_ms: u64) -> Result<RoundStatus> {
        let round = self
            .rounds
            .get_mut(round_id)
            .ok_or_else(|| ConcordError::UnknownRound(round_id.to_string()))?;
        if !round.is_active() {
            return Ok(round.status);
        }

        let status = if round.has_passed() {
            RoundStatus::Passed
        } else if round.is_decided_negative() {
            RoundStatus::Failed
        } else if now_ms >= round.deadline_ms {
            RoundStatus::Timeout
        } else {
            RoundStatus::Failed
        };

        let deadline = round.deadline_ms;
        round.close(status, now_ms);
        self.deadlines.remove(&(deadline, *round_id));
        info!(target: "consensus", "EVENT:COMMIT id={} status={}", round_id, status);
        Ok(status)
    }

    /// Applies an outcome decided elsewhere, e.g. by the round's proposer.
    pub fn force_resolve(
        &mut self,
        round_id: &RoundId,
        status: RoundStatus,
        now_ms: u64,
    ) -> Option<RoundStatus> {
        let round = self.rounds.get_mut(round_id)?;
        let deadline = round.deadline_ms;
        if round.close(status, now_ms) {
            self.deadlines.remove(&(deadline, *round_id));
            debug!("Round {} closed remotely as {}", round_id, status);
        }
        Some(round.status)
    }

    /// Resolves every active round whose deadline has passed.
    pub fn expire_due(&mut self, now_ms: u64) -> Vec<(RoundId, RoundStatus)> {
        let due: Vec<RoundId> = self
            .deadlines
            .iter()
            .take_while(|(deadline, _)| *deadline <= now_ms)
            .map(|(_, id)| *id)
            .collect();

        due.into_iter()
            .filter_map(|id| self.resolve(&id, now_ms).ok().map(|status| (id, status)))
            .collect()
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.deadlines.iter().next().map(|(deadline, _)| *deadline)
    }

    pub fn round(&self, round_id: &RoundId) -> Option<&VotingRound> {
        self.rounds.get(round_id)
    }

    pub fn summary(&self, round_id: &RoundId) -> Option<RoundSummary> {
        self.rounds.get(round_id).map(VotingRound::summary)
    }

    pub fn active_rounds(&self) -> impl Iterator<Item = &VotingRound> {
        self.rounds.values().filter(|r| r.is_active())
    }

    /// Drops rounds resolved before `before_ms`.
    pub fn prune_resolved(&mut self, before_ms: u64) -> usize {
        let before = self.rounds.len();
        self.rounds
            .retain(|_, r| r.resolved_at_ms.map_or(true, |at| at >= before_ms));
        before - self.rounds.len()
    }
}
