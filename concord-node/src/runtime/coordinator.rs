use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, error, info, warn};

use concord_common::{
    config::validate_threshold,
    env::{
        ChangeType, LogIndex, MemberStatus, Proposal, ProposalKind, RoundId, RoundStatus, Term,
        Vote, VoteData,
    },
    ConcordError, ConsensusConfig, NodeId, Result,
};
use concord_consensus::{
    quorum::{weight_concentration, CastOutcome},
    storage::Persistence,
    FaultMonitor, QuorumEngine, RaftAction, RaftEngine, Role, StateMachine,
};
use concord_p2p::{ClusterMessage, Envelope, MemberEvent, MembershipRegistry};

/// Settled rounds are forgotten after this many vote timeouts.
const RETENTION_VOTE_TIMEOUTS: u64 = 4;
const DECISION_HISTORY: usize = 256;

/// How this node answers proposals made by others.
pub trait VotePolicy: Send {
    fn decide(&mut self, proposal: &Proposal, registry: &MembershipRegistry) -> Vote;
}

/// Votes yes on everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproveAll;

impl VotePolicy for ApproveAll {
    fn decide(&mut self, _proposal: &Proposal, _registry: &MembershipRegistry) -> Vote {
        Vote::Yes
    }
}

/// Votes no on everything it did not propose.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectAll;

impl VotePolicy for RejectAll {
    fn decide(&mut self, _proposal: &Proposal, _registry: &MembershipRegistry) -> Vote {
        Vote::No
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Election,
    Heartbeat,
    FaultScan,
    HealthCheck,
    VoteDeadline,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimerCommand {
    /// Fire once after `after`, replacing any pending deadline of that kind.
    Arm { timer: TimerKind, after: Duration },
    Cancel(TimerKind),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Broadcast(ClusterMessage),
    Send { to: NodeId, message: ClusterMessage },
}

/// Work the node loop must carry out after a coordinator call.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Effects {
    pub outbound: Vec<Outbound>,
    pub timers: Vec<TimerCommand>,
}

impl Effects {
    fn broadcast(&mut self, message: ClusterMessage) {
        self.outbound.push(Outbound::Broadcast(message));
    }

    fn arm(&mut self, timer: TimerKind, after: Duration) {
        self.timers.push(TimerCommand::Arm { timer, after });
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.timers.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub node_id: NodeId,
    pub role: Role,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub active_members: usize,
    pub member_count: usize,
    pub suspected_members: usize,
    /// Gini coefficient of the eligible weights.
    pub weight_concentration: f64,
    pub fault_tolerance_level: f64,
    pub can_achieve_quorum: bool,
    pub threat_level: f64,
    pub open_rounds: usize,
    pub recent_decisions: usize,
    pub generated_at: String,
}

/// A round whose outcome is final on this node.
#[derive(Debug, Clone, PartialEq)]
struct Settlement {
    /// Who announced it. Only the proposer's word counts.
    by: NodeId,
    status: RoundStatus,
    at_ms: u64,
}

/// One node's coordination state: membership, weighted voting, fault
/// monitoring and the replicated log, driven by messages and timer firings.
///
/// Every entry point is synchronous and returns the [`Effects`] to perform.
pub struct Coordinator {
    id: NodeId,
    config: ConsensusConfig,
    registry: MembershipRegistry,
    quorum: QuorumEngine,
    monitor: FaultMonitor,
    raft: RaftEngine,
    policy: Box<dyn VotePolicy>,
    default_threshold: f64,
    settled: HashMap<RoundId, Settlement>,
    decisions: VecDeque<(RoundId, Vec<u8>)>,
    events: broadcast::Receiver<MemberEvent>,
}

impl Coordinator {
    pub fn new(
        id: NodeId,
        config: ConsensusConfig,
        members: &[(NodeId, u64)],
        store: Box<dyn Persistence>,
        state_machine: Box<dyn StateMachine>,
        policy: Box<dyn VotePolicy>,
        now_ms: u64,
    ) -> Result<Self> {
        config.validate()?;
        let mut registry = MembershipRegistry::new();
        for (member, weight) in members {
            registry.upsert_member(member.clone(), *weight, now_ms)?;
        }
        if !registry.contains(&id) {
            return Err(ConcordError::UnknownMember(id));
        }

        let raft = RaftEngine::new(id.clone(), &config, store, state_machine)?;
        let monitor = FaultMonitor::new(id.clone(), &config);
        let events = registry.subscribe();
        Ok(Self {
            default_threshold: config.default_threshold,
            id,
            config,
            registry,
            quorum: QuorumEngine::new(),
            monitor,
            raft,
            policy,
            settled: HashMap::new(),
            decisions: VecDeque::new(),
            events,
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn registry(&self) -> &MembershipRegistry {
        &self.registry
    }

    pub fn quorum(&self) -> &QuorumEngine {
        &self.quorum
    }

    pub fn monitor(&self) -> &FaultMonitor {
        &self.monitor
    }

    pub fn raft(&self) -> &RaftEngine {
        &self.raft
    }

    pub fn default_threshold(&self) -> f64 {
        self.default_threshold
    }

    /// The most recent decision payloads that passed, oldest first.
    pub fn decisions(&self) -> &VecDeque<(RoundId, Vec<u8>)> {
        &self.decisions
    }

    /// Final status of a round, while it is still remembered.
    pub fn outcome(&self, round_id: &RoundId) -> Option<RoundStatus> {
        self.settled.get(round_id).map(|s| s.status)
    }

    /// Arms the periodic timers and the first election timeout.
    pub fn start(&mut self, now_ms: u64) -> Result<Effects> {
        let mut effects = Effects::default();
        let actions = self.raft.start(&self.registry)?;
        self.apply_raft_actions(actions, &mut effects);
        effects.arm(TimerKind::FaultScan, self.config.fault_scan_interval());
        effects.arm(TimerKind::HealthCheck, self.config.health_check_interval());
        info!(
            "🚀 Node {} started with {} members (t={}ms)",
            self.id,
            self.registry.member_count(),
            now_ms
        );
        Ok(effects)
    }

    fn apply_raft_actions(&mut self, actions: Vec<RaftAction>, effects: &mut Effects) {
        for action in actions {
            match action {
                RaftAction::Send { to, message } => {
                    effects.outbound.push(Outbound::Send { to, message })
                }
                RaftAction::Broadcast(message) => effects.broadcast(message),
                RaftAction::ResetElectionTimer(after) => effects.arm(TimerKind::Election, after),
                RaftAction::CancelElectionTimer => {
                    effects.timers.push(TimerCommand::Cancel(TimerKind::Election))
                }
                RaftAction::StartHeartbeat(every) => effects.arm(TimerKind::Heartbeat, every),
                RaftAction::StopHeartbeat => {
                    effects.timers.push(TimerCommand::Cancel(TimerKind::Heartbeat))
                }
                RaftAction::ReportFault { member, reason } => {
                    self.monitor.report_fault(&mut self.registry, &member, &reason)
                }
            }
        }
    }

    fn schedule_vote_deadline(&self, now_ms: u64, effects: &mut Effects) {
        match self.quorum.next_deadline() {
            Some(deadline) => effects.arm(
                TimerKind::VoteDeadline,
                Duration::from_millis(deadline.saturating_sub(now_ms)),
            ),
            None => effects.timers.push(TimerCommand::Cancel(TimerKind::VoteDeadline)),
        }
    }

    /// Processes one inbound message.
    pub fn handle(&mut self, envelope: Envelope, now_ms: u64) -> Result<Effects> {
        let Envelope { from, message } = envelope;
        let mut effects = Effects::default();
        if from == self.id {
            return Ok(effects);
        }
        match self.registry.get(&from).map(|m| m.status) {
            None => {
                debug!("Ignoring {} from unknown sender {}", message.kind(), from);
                return Ok(effects);
            }
            Some(MemberStatus::Malicious) => {
                debug!("Ignoring {} from isolated member {}", message.kind(), from);
                return Ok(effects);
            }
            Some(_) => {}
        }

        match message {
            ClusterMessage::RequestVote(_)
            | ClusterMessage::VoteResponse(_)
            | ClusterMessage::AppendEntries(_)
            | ClusterMessage::AppendResponse(_) => {
                let actions = self.raft.handle(&from, &message, &self.registry)?;
                self.apply_raft_actions(actions, &mut effects);
            }
            ClusterMessage::Heartbeat { member_id, timestamp } => {
                if member_id != from {
                    self.monitor.report_fault(
                        &mut self.registry,
                        &from,
                        &format!("heartbeat claiming to be {}", member_id),
                    );
                } else {
                    self.registry.record_heartbeat(&from, now_ms, timestamp);
                }
            }
            ClusterMessage::Propose(proposal) => {
                self.on_remote_proposal(&from, proposal, now_ms, &mut effects)
            }
            ClusterMessage::Vote(vote) => self.on_remote_vote(&from, vote, now_ms, &mut effects),
            ClusterMessage::Commit { proposal } => {
                self.on_remote_commit(&from, proposal, now_ms, &mut effects)
            }
            ClusterMessage::Abort { round_id, status } => {
                self.on_remote_abort(&from, round_id, status, now_ms, &mut effects)
            }
            ClusterMessage::Suspect { member_id, reason } => {
                self.on_suspect(&from, &member_id, &reason, &mut effects)?
            }
        }
        self.drain_member_events();
        Ok(effects)
    }

    /// Whether `from` may author `proposal`. Reports the sender when not.
    fn admissible(&mut self, from: &NodeId, proposal: &Proposal) -> bool {
        if proposal.proposer != *from {
            self.monitor.report_fault(
                &mut self.registry,
                from,
                &format!("relayed proposal {} of {}", proposal.id, proposal.proposer),
            );
            return false;
        }
        if proposal.kind.is_structural()
            && proposal.threshold < self.config.membership_change_threshold
        {
            warn!(
                "Structural proposal {} from {} uses threshold {} below {}",
                proposal.id, from, proposal.threshold, self.config.membership_change_threshold
            );
            self.monitor.report_fault(
                &mut self.registry,
                from,
                "structural proposal without supermajority",
            );
            return false;
        }
        true
    }

    fn settle(&mut self, round_id: RoundId, by: NodeId, status: RoundStatus, now_ms: u64) {
        self.settled.insert(round_id, Settlement { by, status, at_ms: now_ms });
    }

    fn is_settled(&self, round_id: &RoundId, by: &NodeId) -> bool {
        self.settled.get(round_id).map_or(false, |s| s.by == *by)
    }

    fn on_remote_proposal(
        &mut self,
        from: &NodeId,
        proposal: Proposal,
        now_ms: u64,
        effects: &mut Effects,
    ) {
        if self.quorum.round(&proposal.id).is_some() || self.is_settled(&proposal.id, from) {
            return;
        }
        if !self.admissible(from, &proposal) {
            return;
        }

        info!(target: "consensus", "EVENT:RECEIVE_PROPOSAL id={} from={}", proposal.id, from);
        let round_id = proposal.id;
        let vote = self.policy.decide(&proposal, &self.registry);
        if let Err(e) = self.quorum.initiate_vote(proposal, &self.registry, now_ms) {
            warn!("Cannot open round {} from {}: {}", round_id, from, e);
            if matches!(e, ConcordError::InvalidThreshold(_)) {
                self.monitor.report_fault(&mut self.registry, from, &e.to_string());
            }
            return;
        }

        if self.registry.eligible(&self.id) {
            self.cast_local_vote(round_id, vote, now_ms, effects);
        }
        self.schedule_vote_deadline(now_ms, effects);
    }

    fn cast_local_vote(&mut self, round_id: RoundId, vote: Vote, now_ms: u64, effects: &mut Effects) {
        let outcome = self
            .quorum
            .cast_vote(&round_id, &self.id, vote, &self.registry, now_ms);
        match outcome {
            CastOutcome::Recorded { .. } | CastOutcome::Passed => {
                info!(target: "consensus", "EVENT:VOTE round={} voter={} vote={}", round_id, self.id, vote);
                effects.broadcast(ClusterMessage::Vote(VoteData {
                    round_id,
                    voter: self.id.clone(),
                    vote,
                }));
                if outcome == CastOutcome::Passed {
                    self.on_local_resolution(round_id, RoundStatus::Passed, now_ms, effects);
                }
            }
            other => debug!("Local vote on {} not counted: {:?}", round_id, other),
        }
    }

    fn on_remote_vote(&mut self, from: &NodeId, vote: VoteData, now_ms: u64, effects: &mut Effects) {
        if vote.voter != *from {
            self.monitor.report_fault(
                &mut self.registry,
                from,
                &format!("vote cast on behalf of {}", vote.voter),
            );
            return;
        }
        match self
            .quorum
            .cast_vote(&vote.round_id, from, vote.vote, &self.registry, now_ms)
        {
            CastOutcome::Passed => {
                self.on_local_resolution(vote.round_id, RoundStatus::Passed, now_ms, effects);
                self.schedule_vote_deadline(now_ms, effects);
            }
            CastOutcome::Conflicting(evidence) => {
                self.monitor.report_equivocation(&mut self.registry, &evidence);
            }
            CastOutcome::Recorded { .. } | CastOutcome::Duplicate => {}
            CastOutcome::Rejected(reason) => {
                debug!("Vote from {} on {} rejected: {:?}", from, vote.round_id, reason)
            }
        }
    }

    /// A round closed in the local tally. Only the proposer announces and
    /// applies it; everyone else waits for its `Commit`.
    fn on_local_resolution(
        &mut self,
        round_id: RoundId,
        status: RoundStatus,
        now_ms: u64,
        effects: &mut Effects,
    ) {
        let Some(proposal) = self.quorum.round(&round_id).map(|r| r.proposal.clone()) else {
            return;
        };
        if proposal.proposer != self.id {
            return;
        }
        match status {
            RoundStatus::Passed => {
                self.apply_outcome(&proposal, now_ms);
                effects.broadcast(ClusterMessage::Commit { proposal });
            }
            status => {
                self.settle(round_id, self.id.clone(), status, now_ms);
                effects.broadcast(ClusterMessage::Abort { round_id, status });
            }
        }
    }

    fn on_remote_commit(
        &mut self,
        from: &NodeId,
        proposal: Proposal,
        now_ms: u64,
        effects: &mut Effects,
    ) {
        if proposal.proposer != *from {
            self.monitor.report_fault(
                &mut self.registry,
                from,
                &format!("announced outcome of round {} it did not propose", proposal.id),
            );
            return;
        }
        if self.is_settled(&proposal.id, from) {
            debug!("Round {} already settled, ignoring commit from {}", proposal.id, from);
            return;
        }
        match self.quorum.round(&proposal.id).map(|r| r.proposal == proposal) {
            Some(true) => {}
            Some(false) => {
                self.monitor.report_fault(
                    &mut self.registry,
                    from,
                    &format!("commit of round {} differs from its proposal", proposal.id),
                );
                return;
            }
            None => {
                if !self.admissible(from, &proposal) {
                    return;
                }
                debug!("Commit of round {} arrived before its proposal", proposal.id);
            }
        }
        self.quorum
            .force_resolve(&proposal.id, RoundStatus::Passed, now_ms);
        self.apply_outcome(&proposal, now_ms);
        self.schedule_vote_deadline(now_ms, effects);
    }

    fn on_remote_abort(
        &mut self,
        from: &NodeId,
        round_id: RoundId,
        status: RoundStatus,
        now_ms: u64,
        effects: &mut Effects,
    ) {
        if !status.is_terminal() || status == RoundStatus::Passed {
            return;
        }
        if self.is_settled(&round_id, from) {
            return;
        }
        match self.quorum.round(&round_id).map(|r| r.proposal.proposer == *from) {
            Some(false) => {
                self.monitor.report_fault(
                    &mut self.registry,
                    from,
                    &format!("announced outcome of round {} it did not propose", round_id),
                );
                return;
            }
            Some(true) => {
                self.quorum.force_resolve(&round_id, status, now_ms);
            }
            // remembered so the late proposal is not opened
            None => debug!("Abort of round {} arrived before its proposal", round_id),
        }
        self.settle(round_id, from.clone(), status, now_ms);
        self.schedule_vote_deadline(now_ms, effects);
    }

    /// Applies a passed proposal at most once.
    fn apply_outcome(&mut self, proposal: &Proposal, now_ms: u64) {
        if self.is_settled(&proposal.id, &proposal.proposer) {
            return;
        }
        let round_id = proposal.id;
        self.settle(round_id, proposal.proposer.clone(), RoundStatus::Passed, now_ms);
        info!(target: "consensus", "EVENT:APPLY_ROUND id={}", round_id);

        match &proposal.kind {
            ProposalKind::Decision(payload) => {
                info!("✅ Decision {} approved ({} bytes)", round_id, payload.len());
                if self.decisions.len() == DECISION_HISTORY {
                    self.decisions.pop_front();
                }
                self.decisions.push_back((round_id, payload.clone()));
            }
            ProposalKind::MembershipChange(change) => {
                let result = match change.change_type {
                    ChangeType::Add => self.registry.stage_join(
                        change.target.clone(),
                        change.new_weight.unwrap_or(1),
                        now_ms,
                    ),
                    ChangeType::Remove if change.target == self.id => {
                        warn!("👋 {} was voted out and is leaving the cluster", self.id);
                        Ok(self.registry.mark_leaving(&self.id))
                    }
                    ChangeType::Remove => self.registry.remove_member(&change.target),
                    ChangeType::UpdateWeight => match change.new_weight {
                        Some(weight) if self.registry.contains(&change.target) => self
                            .registry
                            .upsert_member(change.target.clone(), weight, now_ms),
                        _ => Err(ConcordError::UnknownMember(change.target.clone())),
                    },
                };
                match result {
                    Ok(event) => info!("Membership change applied: {:?}", event),
                    Err(e) => warn!("Membership change {} not applied: {}", round_id, e),
                }
            }
            ProposalKind::ThresholdChange { threshold } => match validate_threshold(*threshold) {
                Ok(()) => {
                    info!("Default threshold {} -> {}", self.default_threshold, threshold);
                    self.default_threshold = *threshold;
                }
                Err(e) => warn!("Threshold change {} not applied: {}", round_id, e),
            },
        }
        self.drain_member_events();
    }

    /// Reacts to registry changes made since the last call.
    fn drain_member_events(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(MemberEvent::Removed(id)) => {
                    self.monitor.forget(&id);
                    info!(target: "consensus", "EVENT:MEMBER_REMOVED node={} member={}", self.id, id);
                }
                Ok(MemberEvent::StatusChanged { id, from: MemberStatus::Malicious, to }) => {
                    self.monitor.forget(&id);
                    info!("♻️ {} re-admitted as {}", id, to);
                }
                Ok(event) => debug!("Membership event on {}: {:?}", self.id, event),
                Err(TryRecvError::Lagged(missed)) => {
                    warn!("{} missed {} membership events", self.id, missed)
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }

    fn on_suspect(
        &mut self,
        from: &NodeId,
        member_id: &NodeId,
        reason: &str,
        effects: &mut Effects,
    ) -> Result<()> {
        if *member_id == self.id {
            warn!("Peer {} suspects this node: {}", from, reason);
            return Ok(());
        }
        if self
            .monitor
            .record_accusation(&self.registry, from, member_id, reason)
        {
            self.isolate_and_announce(member_id, reason, effects)?;
        }
        Ok(())
    }

    fn isolate_and_announce(
        &mut self,
        member: &NodeId,
        reason: &str,
        effects: &mut Effects,
    ) -> Result<()> {
        if self.monitor.isolate(&mut self.registry, member, reason)? {
            effects.broadcast(ClusterMessage::Suspect {
                member_id: member.clone(),
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    pub fn on_election_timeout(&mut self, _now_ms: u64) -> Result<Effects> {
        let mut effects = Effects::default();
        let actions = self.raft.on_election_timeout(&self.registry)?;
        self.apply_raft_actions(actions, &mut effects);
        Ok(effects)
    }

    pub fn on_heartbeat_tick(&mut self, _now_ms: u64) -> Effects {
        let mut effects = Effects::default();
        if !self.raft.is_leader() {
            return effects;
        }
        let actions = self.raft.on_heartbeat_tick(&self.registry);
        self.apply_raft_actions(actions, &mut effects);
        effects.arm(TimerKind::Heartbeat, self.config.heartbeat_interval());
        effects
    }

    pub fn on_fault_scan(&mut self, now_ms: u64) -> Effects {
        let mut effects = Effects::default();
        let report = self.monitor.scan(&mut self.registry, now_ms);
        for (member, reason) in report.isolated {
            effects.broadcast(ClusterMessage::Suspect {
                member_id: member,
                reason,
            });
        }
        self.drain_member_events();
        effects.arm(TimerKind::FaultScan, self.config.fault_scan_interval());
        effects
    }

    /// Liveness round: announce ourselves, demote silent members, forget
    /// long-settled rounds and log a health report.
    pub fn on_health_check(&mut self, now_ms: u64) -> Effects {
        let mut effects = Effects::default();
        let stamp = chrono::Utc::now().timestamp_millis().max(0) as u64;
        effects.broadcast(ClusterMessage::Heartbeat {
            member_id: self.id.clone(),
            timestamp: stamp,
        });
        self.registry.record_heartbeat(&self.id.clone(), now_ms, stamp);
        self.registry
            .sweep_staleness(now_ms, self.config.heartbeat_timeout_ms);
        self.drain_member_events();

        let horizon = now_ms.saturating_sub(
            self.config
                .vote_timeout_ms
                .saturating_mul(RETENTION_VOTE_TIMEOUTS),
        );
        let pruned = self.quorum.prune_resolved(horizon);
        self.settled.retain(|_, s| s.at_ms >= horizon);
        if pruned > 0 {
            debug!("Pruned {} resolved rounds on {}", pruned, self.id);
        }

        let report = self.health();
        debug!(
            "🩺 {} {} term={} commit={} active={}/{} suspected={} gini={:.2} tolerance={:.2} quorum={} threat={:.1}",
            report.node_id,
            report.role,
            report.term,
            report.commit_index,
            report.active_members,
            report.member_count,
            report.suspected_members,
            report.weight_concentration,
            report.fault_tolerance_level,
            report.can_achieve_quorum,
            report.threat_level
        );
        if !report.can_achieve_quorum {
            warn!("⚠️ {} cannot reach quorum with the current active weight", self.id);
        }
        effects.arm(TimerKind::HealthCheck, self.config.health_check_interval());
        effects
    }

    pub fn on_vote_deadline(&mut self, now_ms: u64) -> Effects {
        let mut effects = Effects::default();
        for (round_id, status) in self.quorum.expire_due(now_ms) {
            info!("⏱️ Round {} resolved as {} at deadline", round_id, status);
            self.on_local_resolution(round_id, status, now_ms, &mut effects);
        }
        self.schedule_vote_deadline(now_ms, &mut effects);
        effects
    }

    /// Appends a command to the replicated log. Fails with `NotLeader` on
    /// followers; retrying elsewhere is the caller's job.
    pub fn submit_command(&mut self, command: Vec<u8>, now_ms: u64) -> Result<(LogIndex, Effects)> {
        let mut effects = Effects::default();
        let (index, actions) = self.raft.submit(command, now_ms, &self.registry)?;
        self.apply_raft_actions(actions, &mut effects);
        Ok((index, effects))
    }

    /// Opens a weighted vote and casts this node's yes vote.
    pub fn propose(&mut self, kind: ProposalKind, now_ms: u64) -> Result<(RoundId, Effects)> {
        if let ProposalKind::MembershipChange(change) = &kind {
            if change.target.is_empty() {
                return Err(ConcordError::MissingIdentifier("membership change target"));
            }
        }
        let threshold = if kind.is_structural() {
            self.config.membership_change_threshold
        } else {
            self.default_threshold
        };
        let proposal = Proposal {
            id: RoundId::generate(),
            proposer: self.id.clone(),
            kind,
            threshold,
            timeout_ms: self.config.vote_timeout_ms,
        };

        let round_id = self
            .quorum
            .initiate_vote(proposal.clone(), &self.registry, now_ms)?;
        let mut effects = Effects::default();
        effects.broadcast(ClusterMessage::Propose(proposal));
        if self.registry.eligible(&self.id) {
            self.cast_local_vote(round_id, Vote::Yes, now_ms, &mut effects);
        }
        self.schedule_vote_deadline(now_ms, &mut effects);
        Ok((round_id, effects))
    }

    pub fn isolate(&mut self, member: &NodeId, reason: &str) -> Result<Effects> {
        let mut effects = Effects::default();
        self.isolate_and_announce(member, reason, &mut effects)?;
        self.drain_member_events();
        Ok(effects)
    }

    pub fn report_malicious(&mut self, member: &NodeId, reason: &str) -> Result<()> {
        if member.is_empty() {
            return Err(ConcordError::MissingIdentifier("member id"));
        }
        self.monitor
            .report_malicious_pattern(&mut self.registry, member, reason);
        self.drain_member_events();
        Ok(())
    }

    pub fn health(&self) -> HealthReport {
        let tolerance = self.monitor.fault_tolerance(&self.registry);
        let weights: Vec<u64> = self.registry.eligible_members().map(|m| m.weight).collect();
        HealthReport {
            node_id: self.id.clone(),
            role: self.raft.role(),
            term: self.raft.current_term(),
            leader: self.raft.leader_id().cloned(),
            commit_index: self.raft.commit_index(),
            last_applied: self.raft.last_applied(),
            active_members: self.registry.active_count(),
            member_count: self.registry.member_count(),
            suspected_members: self.registry.count_with_status(MemberStatus::Suspected),
            weight_concentration: weight_concentration(&weights),
            fault_tolerance_level: tolerance.level,
            can_achieve_quorum: self
                .monitor
                .can_achieve_quorum(&self.registry, self.default_threshold),
            threat_level: self.monitor.threat_level(),
            open_rounds: self.quorum.active_rounds().count(),
            recent_decisions: self.decisions.len(),
            generated_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Logs a persistence failure that aborted an entry point.
    pub(crate) fn log_failure(&self, context: &str, err: &ConcordError) {
        error!("❌ {} on {} failed: {}", context, self.id, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_common::env::MembershipChange;
    use concord_consensus::{raft::AppliedLog, MemoryStore};

    fn config() -> ConsensusConfig {
        ConsensusConfig {
            rng_seed: Some(11),
            ..ConsensusConfig::default()
        }
    }

    fn members(ids: &[&str]) -> Vec<(NodeId, u64)> {
        ids.iter().map(|id| (NodeId::from(*id), 1)).collect()
    }

    fn node(id: &str, ids: &[&str]) -> Coordinator {
        Coordinator::new(
            NodeId::from(id),
            config(),
            &members(ids),
            Box::new(MemoryStore::new()),
            Box::new(AppliedLog::new()),
            Box::new(ApproveAll),
            0,
        )
        .unwrap()
    }

    fn n(id: &str) -> NodeId {
        NodeId::from(id)
    }

    /// Delivers broadcast effects to every other coordinator, recursively.
    fn deliver(nodes: &mut [Coordinator], origin: usize, effects: Effects, now_ms: u64) {
        let mut queue: Vec<(NodeId, Outbound)> = effects
            .outbound
            .into_iter()
            .map(|o| (nodes[origin].id().clone(), o))
            .collect();
        while !queue.is_empty() {
            let (from, outbound) = queue.remove(0);
            for node in nodes.iter_mut() {
                let message = match &outbound {
                    Outbound::Broadcast(m) if *node.id() != from => m.clone(),
                    Outbound::Send { to, message } if to == node.id() => message.clone(),
                    _ => continue,
                };
                let produced = node
                    .handle(Envelope::new(from.clone(), message), now_ms)
                    .unwrap();
                let sender = node.id().clone();
                queue.extend(produced.outbound.into_iter().map(|o| (sender.clone(), o)));
            }
        }
    }

    #[test]
    fn unknown_local_member_is_rejected() {
        let result = Coordinator::new(
            n("ghost"),
            config(),
            &members(&["n1"]),
            Box::new(MemoryStore::new()),
            Box::new(AppliedLog::new()),
            Box::new(ApproveAll),
            0,
        );
        assert!(matches!(result, Err(ConcordError::UnknownMember(_))));
    }

    #[test]
    fn start_arms_every_timer() {
        let mut node = node("n1", &["n1", "n2", "n3"]);
        let effects = node.start(0).unwrap();
        let armed: Vec<TimerKind> = effects
            .timers
            .iter()
            .filter_map(|t| match t {
                TimerCommand::Arm { timer, .. } => Some(*timer),
                _ => None,
            })
            .collect();
        assert!(armed.contains(&TimerKind::Election));
        assert!(armed.contains(&TimerKind::FaultScan));
        assert!(armed.contains(&TimerKind::HealthCheck));
    }

    #[test]
    fn decision_passes_across_the_cluster() {
        let ids = ["n1", "n2", "n3", "n4"];
        let mut nodes: Vec<Coordinator> = ids.iter().map(|id| node(id, &ids)).collect();

        let (round_id, effects) = nodes[0]
            .propose(ProposalKind::Decision(b"ship it".to_vec()), 10)
            .unwrap();
        assert!(effects
            .timers
            .iter()
            .any(|t| matches!(t, TimerCommand::Arm { timer: TimerKind::VoteDeadline, .. })));
        deliver(&mut nodes, 0, effects, 20);

        for node in &nodes {
            assert_eq!(node.quorum().round(&round_id).unwrap().status, RoundStatus::Passed);
            assert_eq!(node.decisions().len(), 1);
        }
    }

    #[test]
    fn approved_join_is_applied_everywhere() {
        let ids = ["n1", "n2", "n3"];
        let mut nodes: Vec<Coordinator> = ids.iter().map(|id| node(id, &ids)).collect();
        let change = MembershipChange::add(n("n4"), 2, n("n1"));

        let (round_id, effects) = nodes[0]
            .propose(ProposalKind::MembershipChange(change), 10)
            .unwrap();
        assert_eq!(nodes[0].quorum().round(&round_id).unwrap().proposal.threshold, 0.75);
        deliver(&mut nodes, 0, effects, 20);

        for node in &nodes {
            let member = node.registry().get(&n("n4")).unwrap();
            assert_eq!(member.status, MemberStatus::Joining);
            assert_eq!(member.weight, 2);
        }
    }

    #[test]
    fn threshold_change_updates_default() {
        let ids = ["n1", "n2", "n3"];
        let mut nodes: Vec<Coordinator> = ids.iter().map(|id| node(id, &ids)).collect();
        let (_, effects) = nodes[1]
            .propose(ProposalKind::ThresholdChange { threshold: 0.8 }, 10)
            .unwrap();
        deliver(&mut nodes, 1, effects, 20);
        for node in &nodes {
            assert_eq!(node.default_threshold(), 0.8);
        }
    }

    #[test]
    fn silent_cluster_times_out_and_aborts() {
        let mut node = node("n1", &["n1", "n2", "n3"]);
        let (round_id, _) = node
            .propose(ProposalKind::Decision(b"x".to_vec()), 0)
            .unwrap();
        let effects = node.on_vote_deadline(5_000);
        assert_eq!(node.quorum().round(&round_id).unwrap().status, RoundStatus::Timeout);
        assert!(effects.outbound.contains(&Outbound::Broadcast(ClusterMessage::Abort {
            round_id,
            status: RoundStatus::Timeout
        })));
        assert!(node.decisions().is_empty());
    }

    #[test]
    fn weak_structural_proposal_is_refused() {
        let mut node = node("n1", &["n1", "n2", "n3"]);
        let proposal = Proposal {
            id: RoundId::generate(),
            proposer: n("n2"),
            kind: ProposalKind::ThresholdChange { threshold: 0.5 },
            threshold: 0.5,
            timeout_ms: 1_000,
        };
        let effects = node
            .handle(Envelope::new(n("n2"), ClusterMessage::Propose(proposal.clone())), 1)
            .unwrap();
        assert!(effects.outbound.is_empty());
        assert!(node.quorum().round(&proposal.id).is_none());
        assert_eq!(node.monitor().record(&n("n2")).unwrap().faults, 1);
    }

    #[test]
    fn equivocating_voter_is_reported() {
        let mut node = node("n1", &["n1", "n2", "n3", "n4"]);
        let (round_id, _) = node
            .propose(ProposalKind::Decision(b"x".to_vec()), 0)
            .unwrap();
        for vote in [Vote::Yes, Vote::No] {
            let message = ClusterMessage::Vote(VoteData {
                round_id,
                voter: n("n3"),
                vote,
            });
            node.handle(Envelope::new(n("n3"), message), 1).unwrap();
        }
        assert_eq!(node.monitor().record(&n("n3")).unwrap().malicious_patterns, 1);
    }

    #[test]
    fn isolation_is_announced_once() {
        let mut node = node("n1", &["n1", "n2", "n3", "n4"]);
        let effects = node.isolate(&n("n4"), "forged votes").unwrap();
        assert_eq!(effects.outbound.len(), 1);
        assert!(node.isolate(&n("n4"), "again").unwrap().outbound.is_empty());
        assert!(matches!(
            node.isolate(&n(""), "no id"),
            Err(ConcordError::MissingIdentifier(_))
        ));

        // messages from the isolated member are dropped
        let hb = ClusterMessage::Heartbeat { member_id: n("n4"), timestamp: 1 };
        assert!(node.handle(Envelope::new(n("n4"), hb), 5).unwrap().is_empty());
    }

    #[test]
    fn health_check_broadcasts_heartbeat_and_reports() {
        let mut node = node("n1", &["n1", "n2", "n3", "n4"]);
        let effects = node.on_health_check(2_000);
        assert!(effects.outbound.iter().any(|o| matches!(
            o,
            Outbound::Broadcast(ClusterMessage::Heartbeat { member_id, .. }) if *member_id == n("n1")
        )));
        let report = node.health();
        assert_eq!(report.member_count, 4);
        // the three silent peers dropped out of the active set
        assert_eq!(report.active_members, 1);
        assert!(!report.can_achieve_quorum);
    }

    #[test]
    fn follower_submit_names_no_leader_yet() {
        let mut node = node("n1", &["n1", "n2", "n3"]);
        assert!(matches!(
            node.submit_command(b"x".to_vec(), 0),
            Err(ConcordError::NotLeader { leader: None })
        ));
    }

    fn broadcasts(effects: &Effects) -> Vec<ClusterMessage> {
        effects
            .outbound
            .iter()
            .filter_map(|o| match o {
                Outbound::Broadcast(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn commit_before_proposal_still_applies() {
        let ids = ["n1", "n2", "n3", "n4"];
        let mut nodes: Vec<Coordinator> = ids.iter().map(|id| node(id, &ids)).collect();
        let change = MembershipChange::add(n("n5"), 1, n("n1"));
        let (round_id, effects) = nodes[0]
            .propose(ProposalKind::MembershipChange(change), 10)
            .unwrap();
        let propose = broadcasts(&effects)
            .into_iter()
            .find(|m| matches!(m, ClusterMessage::Propose(_)))
            .unwrap();

        let mut commit = None;
        for i in [1, 2] {
            let voted = nodes[i]
                .handle(Envelope::new(n("n1"), propose.clone()), 20)
                .unwrap();
            let voter = nodes[i].id().clone();
            for vote in broadcasts(&voted) {
                let out = nodes[0].handle(Envelope::new(voter.clone(), vote), 30).unwrap();
                commit = commit.or_else(|| {
                    broadcasts(&out)
                        .into_iter()
                        .find(|m| matches!(m, ClusterMessage::Commit { .. }))
                });
            }
        }
        let commit = commit.expect("three of four weights commit the join");

        // n4 hears the outcome before the proposal
        let n4 = &mut nodes[3];
        n4.handle(Envelope::new(n("n1"), commit), 40).unwrap();
        let late = n4.handle(Envelope::new(n("n1"), propose), 50).unwrap();
        assert!(late.outbound.is_empty());
        n4.on_vote_deadline(10_000);

        assert_eq!(
            n4.registry().get(&n("n5")).map(|m| m.status),
            Some(MemberStatus::Joining)
        );
        assert_eq!(n4.outcome(&round_id), Some(RoundStatus::Passed));
        assert!(n4.quorum().round(&round_id).is_none());
    }

    #[test]
    fn abort_before_proposal_keeps_round_closed() {
        let mut node = node("n2", &["n1", "n2", "n3"]);
        let proposal = Proposal {
            id: RoundId::generate(),
            proposer: n("n1"),
            kind: ProposalKind::Decision(b"x".to_vec()),
            threshold: 0.67,
            timeout_ms: 1_000,
        };
        let abort = ClusterMessage::Abort {
            round_id: proposal.id,
            status: RoundStatus::Failed,
        };
        node.handle(Envelope::new(n("n1"), abort), 1).unwrap();
        let effects = node
            .handle(Envelope::new(n("n1"), ClusterMessage::Propose(proposal.clone())), 2)
            .unwrap();

        assert!(effects.outbound.is_empty());
        assert!(node.quorum().round(&proposal.id).is_none());
        assert_eq!(node.outcome(&proposal.id), Some(RoundStatus::Failed));
    }

    #[test]
    fn replayed_messages_change_nothing() {
        let ids = ["n1", "n2", "n3"];
        let mut nodes: Vec<Coordinator> = ids.iter().map(|id| node(id, &ids)).collect();
        let (round_id, effects) = nodes[0]
            .propose(ProposalKind::Decision(b"once".to_vec()), 10)
            .unwrap();
        let propose = broadcasts(&effects)
            .into_iter()
            .find(|m| matches!(m, ClusterMessage::Propose(_)))
            .unwrap();
        let proposal = match &propose {
            ClusterMessage::Propose(p) => p.clone(),
            _ => unreachable!(),
        };
        deliver(&mut nodes, 0, effects, 20);
        assert_eq!(nodes[1].decisions().len(), 1);

        let commit = ClusterMessage::Commit { proposal };
        let vote = ClusterMessage::Vote(VoteData {
            round_id,
            voter: n("n2"),
            vote: Vote::Yes,
        });
        for _ in 0..2 {
            let effects = nodes[1]
                .handle(Envelope::new(n("n1"), commit.clone()), 30)
                .unwrap();
            assert!(effects.outbound.is_empty());
            let effects = nodes[1]
                .handle(Envelope::new(n("n1"), propose.clone()), 31)
                .unwrap();
            assert!(effects.outbound.is_empty());
            let effects = nodes[0]
                .handle(Envelope::new(n("n2"), vote.clone()), 32)
                .unwrap();
            assert!(effects.outbound.is_empty());
        }
        for node in &nodes {
            assert_eq!(node.decisions().len(), 1, "{} applied twice", node.id());
        }
        assert!(nodes[1].monitor().record(&n("n1")).is_none());
    }

    #[test]
    fn commit_from_someone_else_is_a_fault() {
        let mut node = node("n2", &["n1", "n2", "n3"]);
        let proposal = Proposal {
            id: RoundId::generate(),
            proposer: n("n1"),
            kind: ProposalKind::ThresholdChange { threshold: 0.9 },
            threshold: 0.75,
            timeout_ms: 1_000,
        };
        node.handle(Envelope::new(n("n3"), ClusterMessage::Commit { proposal }), 1)
            .unwrap();
        assert_eq!(node.default_threshold(), 0.67);
        assert_eq!(node.monitor().record(&n("n3")).unwrap().faults, 1);
    }

    #[test]
    fn settled_rounds_are_forgotten_after_retention() {
        let mut node = node("n1", &["n1", "n2", "n3"]);
        let (round_id, _) = node
            .propose(ProposalKind::Decision(b"x".to_vec()), 0)
            .unwrap();
        node.on_vote_deadline(5_000);
        assert_eq!(node.outcome(&round_id), Some(RoundStatus::Timeout));

        node.on_health_check(20_000);
        assert!(node.quorum().round(&round_id).is_some());
        assert!(node.outcome(&round_id).is_some());

        node.on_health_check(25_001);
        assert!(node.quorum().round(&round_id).is_none());
        assert!(node.outcome(&round_id).is_none());
    }

    #[test]
    fn decision_history_is_bounded() {
        let mut node = node("n1", &["n1"]);
        let mut last = None;
        for i in 0..(DECISION_HISTORY + 10) {
            let (round_id, _) = node
                .propose(ProposalKind::Decision(i.to_string().into_bytes()), i as u64)
                .unwrap();
            last = Some(round_id);
        }
        assert_eq!(node.decisions().len(), DECISION_HISTORY);
        assert_eq!(node.decisions().back().map(|(id, _)| *id), last);
        assert_eq!(node.health().recent_decisions, DECISION_HISTORY);
    }

    #[test]
    fn removal_clears_history_and_retires_the_target() {
        let ids = ["n1", "n2", "n3", "n4"];
        let mut nodes: Vec<Coordinator> = ids.iter().map(|id| node(id, &ids)).collect();
        nodes[0].report_malicious(&n("n4"), "forged signature").unwrap();
        assert!(nodes[0].monitor().record(&n("n4")).is_some());

        let change = MembershipChange::remove(n("n4"), n("n1"));
        let (_, effects) = nodes[0]
            .propose(ProposalKind::MembershipChange(change), 10)
            .unwrap();
        deliver(&mut nodes, 0, effects, 20);

        for node in &nodes[..3] {
            assert!(!node.registry().contains(&n("n4")), "{} kept n4", node.id());
        }
        assert!(nodes[0].monitor().record(&n("n4")).is_none());
        // the removed node steps out of its own electorate
        let own = nodes[3].registry().get(&n("n4")).unwrap();
        assert_eq!(own.status, MemberStatus::Leaving);
        assert!(!nodes[3].registry().voters().contains(&n("n4")));
    }

    #[test]
    fn health_reports_weight_spread() {
        let mut node = Coordinator::new(
            n("n1"),
            config(),
            &[(n("n1"), 1), (n("n2"), 1), (n("n3"), 10)],
            Box::new(MemoryStore::new()),
            Box::new(AppliedLog::new()),
            Box::new(ApproveAll),
            0,
        )
        .unwrap();
        assert!(node.health().weight_concentration > 0.4);
        assert_eq!(node.health().suspected_members, 0);

        node.on_health_check(10_000);
        // only n1 heartbeats; the others are silent past three timeouts
        assert_eq!(node.health().suspected_members, 2);
        assert_eq!(node.health().weight_concentration, 0.0);
    }
}
