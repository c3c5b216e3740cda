use std::collections::BTreeSet;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use concord_common::{
    env::{LogEntry, LogIndex, MemberStatus, Term},
    ConcordError, ConsensusConfig, NodeId, Result,
};
use concord_p2p::{
    message::{AppendEntries, AppendResponse, RequestVote, VoteResponse},
    ClusterMessage, MembershipRegistry,
};

use super::log::RaftLog;
use super::state::{HardState, LeaderState, NodeState, PersistentState, Role};
use super::state_machine::StateMachine;
use crate::quorum::has_majority;
use crate::storage::{Persistence, StoreMetadata};

pub const RAFT_STATE_KEY: &str = "raft/state";

/// Store key of the log entry at `index`.
pub fn log_key(index: LogIndex) -> String {
    format!("raft/log/{}", index)
}

/// Side effects requested by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum RaftAction {
    Send { to: NodeId, message: ClusterMessage },
    Broadcast(ClusterMessage),
    ResetElectionTimer(Duration),
    CancelElectionTimer,
    StartHeartbeat(Duration),
    StopHeartbeat,
    ReportFault { member: NodeId, reason: String },
}

pub struct RaftEngine {
    id: NodeId,
    election_window: (u64, u64),
    heartbeat_interval: Duration,
    max_entries_per_append: usize,
    state: NodeState,
    store: Box<dyn Persistence>,
    /// Entries `1..=synced_len` are already in the store as they are in memory.
    synced_len: LogIndex,
    state_machine: Box<dyn StateMachine>,
    rng: StdRng,
}

fn load_persistent(store: &dyn Persistence, hard: HardState) -> Result<PersistentState> {
    let mut log = RaftLog::new();
    for index in 1..=hard.log_len {
        let record = store
            .retrieve(&log_key(index))?
            .ok_or_else(|| ConcordError::Storage(format!("log entry {} missing", index)))?;
        let entry: LogEntry = serde_json::from_value(record.value)?;
        if !log.push(entry) {
            return Err(ConcordError::Storage(format!("log entry {} out of place", index)));
        }
    }
    log.mark_committed(1, hard.commit_index);
    Ok(PersistentState {
        current_term: hard.current_term,
        voted_for: hard.voted_for,
        log,
        commit_index: hard.commit_index,
        last_applied: hard.last_applied,
    })
}

// Nodes sharing a configured seed must still draw different timeouts.
fn node_seed(seed: u64, id: &NodeId) -> u64 {
    id.as_str()
        .bytes()
        .fold(seed ^ 0xcbf2_9ce4_8422_2325, |h, b| {
            (h ^ b as u64).wrapping_mul(0x0100_0000_01b3)
        })
}

impl RaftEngine {
    /// Builds the engine and reloads whatever `store` holds for it.
    pub fn new(
        id: NodeId,
        config: &ConsensusConfig,
        store: Box<dyn Persistence>,
        state_machine: Box<dyn StateMachine>,
    ) -> Result<Self> {
        if id.is_empty() {
            return Err(ConcordError::MissingIdentifier("node id"));
        }
        let persistent = match store.retrieve(RAFT_STATE_KEY)? {
            Some(record) => {
                let hard: HardState = serde_json::from_value(record.value)?;
                let state = load_persistent(store.as_ref(), hard)?;
                info!(
                    "💾 Restored Raft state: term {} log {} commit {}",
                    state.current_term,
                    state.log.last_index(),
                    state.commit_index
                );
                state
            }
            None => PersistentState::default(),
        };
        let synced_len = persistent.log.last_index();
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(node_seed(seed, &id)),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            id,
            election_window: (
                config.election_timeout_range_ms.min,
                config.election_timeout_range_ms.max,
            ),
            heartbeat_interval: config.heartbeat_interval(),
            max_entries_per_append: config.max_entries_per_append.max(1),
            state: NodeState::from_persistent(persistent),
            store,
            synced_len,
            state_machine,
            rng,
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.state.role
    }

    pub fn is_leader(&self) -> bool {
        self.state.role == Role::Leader
    }

    pub fn current_term(&self) -> Term {
        self.state.persistent.current_term
    }

    pub fn voted_for(&self) -> Option<&NodeId> {
        self.state.persistent.voted_for.as_ref()
    }

    pub fn leader_id(&self) -> Option<&NodeId> {
        self.state.leader_id.as_ref()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.state.persistent.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.state.persistent.last_applied
    }

    pub fn log(&self) -> &RaftLog {
        &self.state.persistent.log
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }

    pub fn leader_state(&self) -> Option<&LeaderState> {
        self.state.leader.as_ref()
    }

    fn random_election_timeout(&mut self) -> Duration {
        let (min, max) = self.election_window;
        Duration::from_millis(self.rng.gen_range(min..=max))
    }

    /// Writes log entries not yet in the store, then the hard state that
    /// makes them live.
    fn persist(&mut self) -> Result<()> {
        let log = &self.state.persistent.log;
        let last_index = log.last_index();
        for index in self.synced_len + 1..=last_index {
            if let Some(entry) = log.get(index) {
                let metadata = StoreMetadata::now()
                    .with_label("node", &self.id)
                    .with_label("term", entry.term);
                self.store
                    .store(&log_key(index), serde_json::to_value(entry)?, metadata)?;
            }
        }
        self.synced_len = last_index;

        let value = serde_json::to_value(self.state.persistent.hard_state())?;
        let metadata = StoreMetadata::now()
            .with_label("node", &self.id)
            .with_label("term", self.state.persistent.current_term);
        self.store.store(RAFT_STATE_KEY, value, metadata)
    }

    /// Arms the first election timer. A node that is the only voter elects
    /// itself right away.
    pub fn start(&mut self, registry: &MembershipRegistry) -> Result<Vec<RaftAction>> {
        let voters = registry.voters();
        if voters.len() == 1 && voters.contains(&self.id) {
            return self.start_election(registry);
        }
        Ok(vec![RaftAction::ResetElectionTimer(self.random_election_timeout())])
    }

    pub fn on_election_timeout(&mut self, registry: &MembershipRegistry) -> Result<Vec<RaftAction>> {
        if self.is_leader() {
            return Ok(Vec::new());
        }
        if !registry.voters().contains(&self.id) {
            debug!("Election timeout ignored: {} is not a voter", self.id);
            return Ok(vec![RaftAction::ResetElectionTimer(self.random_election_timeout())]);
        }
        self.start_election(registry)
    }

    fn start_election(&mut self, registry: &MembershipRegistry) -> Result<Vec<RaftAction>> {
        let persistent = &mut self.state.persistent;
        persistent.current_term += 1;
        persistent.voted_for = Some(self.id.clone());
        let term = persistent.current_term;

        self.state.role = Role::Candidate;
        self.state.leader_id = None;
        self.state.leader = None;
        self.state.votes_received = BTreeSet::from([self.id.clone()]);
        self.persist()?;

        info!(target: "consensus", "EVENT:ELECTION term={} candidate={}", term, self.id);
        let mut actions = vec![
            RaftAction::ResetElectionTimer(self.random_election_timeout()),
            RaftAction::Broadcast(ClusterMessage::RequestVote(RequestVote {
                term,
                candidate_id: self.id.clone(),
                last_log_index: self.state.persistent.log.last_index(),
                last_log_term: self.state.persistent.log.last_term(),
            })),
        ];

        let voters = registry.voters();
        if has_majority(1, voters.len()) {
            actions.extend(self.become_leader(registry)?);
        }
        Ok(actions)
    }

    fn become_leader(&mut self, registry: &MembershipRegistry) -> Result<Vec<RaftAction>> {
        self.state.role = Role::Leader;
        self.state.leader_id = Some(self.id.clone());
        self.state.leader = Some(LeaderState::default());
        info!(
            target: "consensus",
            "EVENT:LEADER term={} leader={}", self.current_term(), self.id
        );
        info!("👑 {} is leader for term {}", self.id, self.current_term());

        let mut actions = vec![
            RaftAction::CancelElectionTimer,
            RaftAction::StartHeartbeat(self.heartbeat_interval),
        ];
        actions.extend(self.replicate_all(registry));
        if self.advance_commit(registry) {
            self.persist()?;
        }
        Ok(actions)
    }

    fn become_follower(&mut self, term: Term, leader: Option<NodeId>) -> Vec<RaftAction> {
        let was_leader = self.is_leader();
        if term > self.state.persistent.current_term {
            self.state.persistent.current_term = term;
            self.state.persistent.voted_for = None;
        }
        self.state.role = Role::Follower;
        self.state.leader_id = leader;
        self.state.leader = None;
        self.state.votes_received.clear();

        if was_leader {
            info!("⬇️ {} stepping down in term {}", self.id, term);
            vec![
                RaftAction::StopHeartbeat,
                RaftAction::ResetElectionTimer(self.random_election_timeout()),
            ]
        } else {
            Vec::new()
        }
    }

    /// Adopts a higher term. Returns whether the term changed.
    fn observe_term(&mut self, term: Term, actions: &mut Vec<RaftAction>) -> bool {
        if term <= self.current_term() {
            return false;
        }
        debug!("{} adopting term {} (was {})", self.id, term, self.current_term());
        actions.extend(self.become_follower(term, None));
        true
    }

    pub fn on_heartbeat_tick(&mut self, registry: &MembershipRegistry) -> Vec<RaftAction> {
        if !self.is_leader() {
            return Vec::new();
        }
        self.replicate_all(registry)
    }

    fn replicate_all(&mut self, registry: &MembershipRegistry) -> Vec<RaftAction> {
        let peers: Vec<NodeId> = registry
            .voters()
            .into_iter()
            .filter(|peer| *peer != self.id)
            .collect();
        peers.iter().filter_map(|peer| self.append_for(peer)).collect()
    }

    fn append_for(&mut self, peer: &NodeId) -> Option<RaftAction> {
        let log = &self.state.persistent.log;
        let last_index = log.last_index();
        let leader = self.state.leader.as_mut()?;
        let next = *leader
            .next_index
            .entry(peer.clone())
            .or_insert(last_index + 1);
        leader.match_index.entry(peer.clone()).or_insert(0);

        let next = next.clamp(1, last_index + 1);
        let prev_log_index = next - 1;
        let message = AppendEntries {
            term: self.state.persistent.current_term,
            prev_log_index,
            prev_log_term: log.term_at(prev_log_index).unwrap_or(0),
            entries: log.entries_from(next, self.max_entries_per_append),
            leader_commit: self.state.persistent.commit_index,
        };
        Some(RaftAction::Send {
            to: peer.clone(),
            message: ClusterMessage::AppendEntries(message),
        })
    }

    /// Appends a client command. Only the leader accepts commands.
    pub fn submit(
        &mut self,
        command: Vec<u8>,
        now_ms: u64,
        registry: &MembershipRegistry,
    ) -> Result<(LogIndex, Vec<RaftAction>)> {
        if !self.is_leader() {
            return Err(ConcordError::NotLeader {
                leader: self.state.leader_id.clone(),
            });
        }
        let term = self.current_term();
        let index = self.state.persistent.log.append_command(term, command, now_ms);
        self.persist()?;
        debug!("Appended entry {} in term {}", index, term);

        let actions = self.replicate_all(registry);
        if self.advance_commit(registry) {
            self.persist()?;
        }
        Ok((index, actions))
    }

    /// Routes a Raft message. Other cluster messages are ignored.
    pub fn handle(
        &mut self,
        from: &NodeId,
        message: &ClusterMessage,
        registry: &MembershipRegistry,
    ) -> Result<Vec<RaftAction>> {
        if *from == self.id {
            return Ok(Vec::new());
        }
        match registry.get(from).map(|m| m.status) {
            None => {
                debug!("Dropping {} from unknown member {}", message.kind(), from);
                return Ok(Vec::new());
            }
            Some(MemberStatus::Malicious) => {
                debug!("Dropping {} from isolated member {}", message.kind(), from);
                return Ok(Vec::new());
            }
            Some(_) => {}
        }

        match message {
            ClusterMessage::RequestVote(req) => self.handle_request_vote(from, req, registry),
            ClusterMessage::VoteResponse(resp) => self.handle_vote_response(from, resp, registry),
            ClusterMessage::AppendEntries(req) => self.handle_append_entries(from, req),
            ClusterMessage::AppendResponse(resp) => {
                self.handle_append_response(from, resp, registry)
            }
            _ => Ok(Vec::new()),
        }
    }

    fn handle_request_vote(
        &mut self,
        from: &NodeId,
        req: &RequestVote,
        registry: &MembershipRegistry,
    ) -> Result<Vec<RaftAction>> {
        if req.candidate_id != *from {
            return Ok(vec![RaftAction::ReportFault {
                member: from.clone(),
                reason: format!("vote request on behalf of {}", req.candidate_id),
            }]);
        }

        let mut actions = Vec::new();
        let mut dirty = self.observe_term(req.term, &mut actions);

        let persistent = &self.state.persistent;
        let free_to_vote = persistent
            .voted_for
            .as_ref()
            .map_or(true, |v| v == &req.candidate_id);
        let grant = req.term == persistent.current_term
            && free_to_vote
            && persistent
                .log
                .is_up_to_date(req.last_log_term, req.last_log_index)
            && registry.voters().contains(from);

        if grant {
            if self.state.persistent.voted_for.is_none() {
                self.state.persistent.voted_for = Some(req.candidate_id.clone());
                dirty = true;
            }
            actions.push(RaftAction::ResetElectionTimer(self.random_election_timeout()));
        }
        if dirty {
            self.persist()?;
        }

        debug!(
            "{} vote for {} in term {}: {}",
            self.id, from, req.term, grant
        );
        actions.push(RaftAction::Send {
            to: from.clone(),
            message: ClusterMessage::VoteResponse(VoteResponse {
                term: self.current_term(),
                vote_granted: grant,
            }),
        });
        Ok(actions)
    }

    fn handle_vote_response(
        &mut self,
        from: &NodeId,
        resp: &VoteResponse,
        registry: &MembershipRegistry,
    ) -> Result<Vec<RaftAction>> {
        let mut actions = Vec::new();
        if self.observe_term(resp.term, &mut actions) {
            self.persist()?;
            return Ok(actions);
        }
        if self.state.role != Role::Candidate || resp.term != self.current_term() {
            return Ok(actions);
        }

        let voters = registry.voters();
        if resp.vote_granted && voters.contains(from) {
            self.state.votes_received.insert(from.clone());
        }
        let granted = self
            .state
            .votes_received
            .iter()
            .filter(|v| voters.contains(*v))
            .count();
        if has_majority(granted, voters.len()) {
            actions.extend(self.become_leader(registry)?);
        }
        Ok(actions)
    }

    fn reject_append(&self, to: &NodeId, hint: LogIndex) -> RaftAction {
        RaftAction::Send {
            to: to.clone(),
            message: ClusterMessage::AppendResponse(AppendResponse {
                term: self.current_term(),
                success: false,
                match_index: hint,
            }),
        }
    }

    fn handle_append_entries(&mut self, from: &NodeId, req: &AppendEntries) -> Result<Vec<RaftAction>> {
        if req.term < self.current_term() {
            debug!("Rejecting append from {} with stale term {}", from, req.term);
            return Ok(vec![self.reject_append(from, 0)]);
        }

        let mut actions = Vec::new();
        let mut dirty = false;
        if req.term > self.current_term() {
            actions.extend(self.become_follower(req.term, Some(from.clone())));
            dirty = true;
        } else {
            match self.state.role {
                Role::Leader => {
                    warn!("Second leader {} claims term {}", from, req.term);
                    return Ok(vec![
                        RaftAction::ReportFault {
                            member: from.clone(),
                            reason: format!("append entries from a second leader in term {}", req.term),
                        },
                        self.reject_append(from, 0),
                    ]);
                }
                Role::Candidate => {
                    actions.extend(self.become_follower(req.term, Some(from.clone())));
                }
                Role::Follower => {}
            }
        }
        self.state.leader_id = Some(from.clone());
        actions.push(RaftAction::ResetElectionTimer(self.random_election_timeout()));

        let commit_index = self.commit_index();
        let log = &self.state.persistent.log;
        match log.term_at(req.prev_log_index) {
            None => {
                let hint = log.last_index();
                if dirty {
                    self.persist()?;
                }
                actions.push(self.reject_append(from, hint));
                return Ok(actions);
            }
            Some(term) if term != req.prev_log_term => {
                if req.prev_log_index <= commit_index {
                    actions.push(RaftAction::ReportFault {
                        member: from.clone(),
                        reason: format!("prev entry {} conflicts with committed log", req.prev_log_index),
                    });
                }
                let hint = log
                    .first_index_of_term(term, req.prev_log_index)
                    .saturating_sub(1)
                    .max(commit_index)
                    .min(req.prev_log_index.saturating_sub(1));
                if dirty {
                    self.persist()?;
                }
                actions.push(self.reject_append(from, hint));
                return Ok(actions);
            }
            Some(_) => {}
        }

        for (offset, entry) in req.entries.iter().enumerate() {
            let expected = req.prev_log_index + 1 + offset as LogIndex;
            if entry.index != expected {
                actions.push(RaftAction::ReportFault {
                    member: from.clone(),
                    reason: format!("entry {} sent where {} was expected", entry.index, expected),
                });
                if dirty {
                    self.persist()?;
                }
                actions.push(self.reject_append(from, self.state.persistent.log.last_index()));
                return Ok(actions);
            }

            match self.state.persistent.log.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) if entry.index <= commit_index => {
                    warn!("Refusing to overwrite committed entry {} from {}", entry.index, from);
                    actions.push(RaftAction::ReportFault {
                        member: from.clone(),
                        reason: format!("attempted to overwrite committed entry {}", entry.index),
                    });
                    if dirty {
                        self.persist()?;
                    }
                    actions.push(self.reject_append(from, commit_index));
                    return Ok(actions);
                }
                Some(_) => {
                    debug!("Truncating conflicting suffix from {}", entry.index);
                    self.state.persistent.log.truncate_from(entry.index);
                    self.synced_len = self.synced_len.min(entry.index - 1);
                    self.state.persistent.log.push(entry.clone());
                }
                None => {
                    self.state.persistent.log.push(entry.clone());
                }
            }
            dirty = true;
        }

        let last_new = req.prev_log_index + req.entries.len() as LogIndex;
        let target = req.leader_commit.min(last_new);
        if target > commit_index {
            self.commit_to(target);
            dirty = true;
        }
        if dirty {
            self.persist()?;
        }

        actions.push(RaftAction::Send {
            to: from.clone(),
            message: ClusterMessage::AppendResponse(AppendResponse {
                term: self.current_term(),
                success: true,
                match_index: last_new,
            }),
        });
        Ok(actions)
    }

    fn handle_append_response(
        &mut self,
        from: &NodeId,
        resp: &AppendResponse,
        registry: &MembershipRegistry,
    ) -> Result<Vec<RaftAction>> {
        let mut actions = Vec::new();
        if self.observe_term(resp.term, &mut actions) {
            self.persist()?;
            return Ok(actions);
        }
        if !self.is_leader() || resp.term != self.current_term() {
            return Ok(actions);
        }

        let last_index = self.state.persistent.log.last_index();
        let Some(leader) = self.state.leader.as_mut() else {
            return Ok(actions);
        };
        let next = leader.next_index.get(from).copied().unwrap_or(last_index + 1);

        if resp.success {
            let matched = leader.match_index.entry(from.clone()).or_insert(0);
            *matched = (*matched).max(resp.match_index.min(last_index));
            let matched = *matched;
            leader.next_index.insert(from.clone(), matched + 1);

            if self.advance_commit(registry) {
                self.persist()?;
            }
            if matched < last_index {
                actions.extend(self.append_for(from));
            }
        } else {
            let backoff = next.saturating_sub(1).min(resp.match_index + 1).max(1);
            leader.next_index.insert(from.clone(), backoff);
            debug!("{} rejected append, next index now {}", from, backoff);
            actions.extend(self.append_for(from));
        }
        Ok(actions)
    }

    /// Commits the highest entry of the current term stored on a majority.
    fn advance_commit(&mut self, registry: &MembershipRegistry) -> bool {
        let Some(leader) = self.state.leader.as_ref() else {
            return false;
        };
        let voters = registry.voters();
        let log = &self.state.persistent.log;
        let term = self.state.persistent.current_term;
        let commit_index = self.state.persistent.commit_index;

        let mut candidate = log.last_index();
        while candidate > commit_index {
            match log.term_at(candidate) {
                Some(t) if t == term => {}
                // older terms are only committed by covering them
                _ => break,
            }
            let replicated = voters
                .iter()
                .filter(|v| {
                    **v == self.id
                        || leader.match_index.get(*v).copied().unwrap_or(0) >= candidate
                })
                .count();
            if has_majority(replicated, voters.len()) {
                self.commit_to(candidate);
                return true;
            }
            candidate -= 1;
        }
        false
    }

    fn commit_to(&mut self, index: LogIndex) {
        let persistent = &mut self.state.persistent;
        if index <= persistent.commit_index {
            return;
        }
        let from = persistent.commit_index + 1;
        persistent.log.mark_committed(from, index);
        persistent.commit_index = index;
        info!(target: "consensus", "EVENT:COMMIT_INDEX node={} index={}", self.id, index);
        self.apply_committed();
    }

    fn apply_committed(&mut self) {
        let persistent = &mut self.state.persistent;
        while persistent.last_applied < persistent.commit_index {
            let next = persistent.last_applied + 1;
            let Some(entry) = persistent.log.get(next) else {
                break;
            };
            self.state_machine.apply(entry);
            persistent.last_applied = next;
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.state.persistent.log.iter()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, VecDeque};

    use super::*;
    use crate::raft::AppliedLog;
    use crate::storage::MemoryStore;

    fn config() -> ConsensusConfig {
        ConsensusConfig {
            rng_seed: Some(7),
            ..ConsensusConfig::default()
        }
    }

    fn registry(ids: &[&str]) -> MembershipRegistry {
        let mut registry = MembershipRegistry::new();
        for id in ids {
            registry.upsert_member(NodeId::from(*id), 1, 0).unwrap();
        }
        registry
    }

    fn engine(id: &str) -> RaftEngine {
        engine_with(id, MemoryStore::new(), AppliedLog::new())
    }

    fn engine_with(id: &str, store: MemoryStore, applied: AppliedLog) -> RaftEngine {
        RaftEngine::new(NodeId::from(id), &config(), Box::new(store), Box::new(applied)).unwrap()
    }

    fn n(id: &str) -> NodeId {
        NodeId::from(id)
    }

    /// Synchronous message router between engines sharing one registry.
    struct Cluster {
        engines: BTreeMap<NodeId, RaftEngine>,
        applied: BTreeMap<NodeId, AppliedLog>,
        registry: MembershipRegistry,
        down: BTreeSet<NodeId>,
    }

    impl Cluster {
        fn new(ids: &[&str]) -> Self {
            let mut engines = BTreeMap::new();
            let mut applied = BTreeMap::new();
            for id in ids {
                let log = AppliedLog::new();
                engines.insert(n(id), engine_with(id, MemoryStore::new(), log.clone()));
                applied.insert(n(id), log);
            }
            Self {
                engines,
                applied,
                registry: registry(ids),
                down: BTreeSet::new(),
            }
        }

        fn deliver(&mut self, origin: &NodeId, actions: Vec<RaftAction>) {
            let mut queue: VecDeque<(NodeId, NodeId, ClusterMessage)> = VecDeque::new();
            let enqueue = |from: &NodeId, actions: Vec<RaftAction>, queue: &mut VecDeque<_>, ids: &[NodeId]| {
                for action in actions {
                    match action {
                        RaftAction::Send { to, message } => queue.push_back((from.clone(), to, message)),
                        RaftAction::Broadcast(message) => {
                            for to in ids.iter().filter(|id| *id != from) {
                                queue.push_back((from.clone(), to.clone(), message.clone()));
                            }
                        }
                        _ => {}
                    }
                }
            };
            let ids: Vec<NodeId> = self.engines.keys().cloned().collect();
            enqueue(origin, actions, &mut queue, &ids);

            while let Some((from, to, message)) = queue.pop_front() {
                if self.down.contains(&to) || self.down.contains(&from) {
                    continue;
                }
                let Some(engine) = self.engines.get_mut(&to) else {
                    continue;
                };
                let produced = engine.handle(&from, &message, &self.registry).unwrap();
                enqueue(&to, produced, &mut queue, &ids);
            }
        }

        fn elect(&mut self, id: &str) {
            let actions = self
                .engines
                .get_mut(&n(id))
                .unwrap()
                .on_election_timeout(&self.registry)
                .unwrap();
            self.deliver(&n(id), actions);
        }

        fn submit(&mut self, id: &str, command: &[u8]) -> LogIndex {
            let (index, actions) = self
                .engines
                .get_mut(&n(id))
                .unwrap()
                .submit(command.to_vec(), 1, &self.registry)
                .unwrap();
            self.deliver(&n(id), actions);
            index
        }

        fn tick(&mut self, id: &str) {
            let actions = self
                .engines
                .get_mut(&n(id))
                .unwrap()
                .on_heartbeat_tick(&self.registry);
            self.deliver(&n(id), actions);
        }

        fn get(&self, id: &str) -> &RaftEngine {
            &self.engines[&n(id)]
        }
    }

    #[test]
    fn start_arms_randomized_election_timer() {
        let registry = registry(&["n1", "n2", "n3"]);
        let mut engine = engine("n1");
        let actions = engine.start(&registry).unwrap();
        match actions.as_slice() {
            [RaftAction::ResetElectionTimer(d)] => {
                assert!(*d >= Duration::from_millis(150) && *d <= Duration::from_millis(300));
            }
            other => panic!("unexpected actions {:?}", other),
        }
        assert_eq!(engine.role(), Role::Follower);
        assert_eq!(engine.current_term(), 0);
    }

    #[test]
    fn election_timeout_starts_one_election() {
        let registry = registry(&["n1", "n2", "n3"]);
        let mut engine = engine("n1");
        engine.start(&registry).unwrap();

        let actions = engine.on_election_timeout(&registry).unwrap();
        assert_eq!(engine.role(), Role::Candidate);
        assert_eq!(engine.current_term(), 1);
        assert_eq!(engine.voted_for(), Some(&n("n1")));
        assert!(actions.iter().any(|a| matches!(
            a,
            RaftAction::Broadcast(ClusterMessage::RequestVote(RequestVote { term: 1, .. }))
        )));

        // a stray heartbeat tick must not bump the term
        assert!(engine.on_heartbeat_tick(&registry).is_empty());
        assert_eq!(engine.current_term(), 1);
    }

    #[test]
    fn single_voter_leads_immediately() {
        let registry = registry(&["solo"]);
        let mut engine = engine("solo");
        let actions = engine.start(&registry).unwrap();
        assert!(engine.is_leader());
        assert!(actions.contains(&RaftAction::StartHeartbeat(Duration::from_millis(50))));

        let (index, _) = engine.submit(b"set x".to_vec(), 5, &registry).unwrap();
        assert_eq!(index, 1);
        assert_eq!(engine.commit_index(), 1);
        assert_eq!(engine.last_applied(), 1);
    }

    fn vote_request(term: Term, candidate: &str, last_index: LogIndex, last_term: Term) -> ClusterMessage {
        ClusterMessage::RequestVote(RequestVote {
            term,
            candidate_id: n(candidate),
            last_log_index: last_index,
            last_log_term: last_term,
        })
    }

    fn granted(actions: &[RaftAction]) -> bool {
        actions.iter().any(|a| matches!(
            a,
            RaftAction::Send { message: ClusterMessage::VoteResponse(VoteResponse { vote_granted: true, .. }), .. }
        ))
    }

    #[test]
    fn one_vote_per_term() {
        let registry = registry(&["n1", "n2", "n3"]);
        let mut engine = engine("n1");

        let actions = engine.handle(&n("n2"), &vote_request(1, "n2", 0, 0), &registry).unwrap();
        assert!(granted(&actions));
        assert!(actions.iter().any(|a| matches!(a, RaftAction::ResetElectionTimer(_))));

        let actions = engine.handle(&n("n3"), &vote_request(1, "n3", 0, 0), &registry).unwrap();
        assert!(!granted(&actions));

        // duplicate request from the same candidate is granted again
        let actions = engine.handle(&n("n2"), &vote_request(1, "n2", 0, 0), &registry).unwrap();
        assert!(granted(&actions));

        // a new term frees the vote
        let actions = engine.handle(&n("n3"), &vote_request(2, "n3", 0, 0), &registry).unwrap();
        assert!(granted(&actions));
        assert_eq!(engine.voted_for(), Some(&n("n3")));
    }

    #[test]
    fn stale_log_or_term_is_refused() {
        let mut cluster = Cluster::new(&["n1", "n2", "n3"]);
        cluster.elect("n1");
        cluster.submit("n1", b"a");
        cluster.submit("n1", b"b");

        let follower = cluster.engines.get_mut(&n("n2")).unwrap();
        let term = follower.current_term();
        assert_eq!(follower.log().last_index(), 2);

        // shorter log in a later term
        let actions = follower
            .handle(&n("n3"), &vote_request(term + 1, "n3", 1, term), &cluster.registry)
            .unwrap();
        assert!(!granted(&actions));
        // lower term
        let actions = follower
            .handle(&n("n3"), &vote_request(term - 1, "n3", 5, term), &cluster.registry)
            .unwrap();
        assert!(!granted(&actions));
    }

    #[test]
    fn three_nodes_elect_replicate_and_apply() {
        let mut cluster = Cluster::new(&["n1", "n2", "n3"]);
        cluster.elect("n1");
        assert!(cluster.get("n1").is_leader());
        assert_eq!(cluster.get("n2").leader_id(), Some(&n("n1")));

        let index = cluster.submit("n1", b"deploy v2");
        assert_eq!(index, 1);
        assert_eq!(cluster.get("n1").commit_index(), 1);
        assert_eq!(cluster.applied[&n("n1")].entries(), vec![(1, b"deploy v2".to_vec())]);

        cluster.tick("n1");
        for id in ["n2", "n3"] {
            assert_eq!(cluster.get(id).commit_index(), 1);
            assert_eq!(cluster.get(id).last_applied(), 1);
            assert_eq!(cluster.applied[&n(id)].len(), 1);
        }
    }

    #[test]
    fn follower_rejects_submit_with_leader_hint() {
        let mut cluster = Cluster::new(&["n1", "n2", "n3"]);
        cluster.elect("n1");
        let registry = cluster.registry.clone();
        let follower = cluster.engines.get_mut(&n("n2")).unwrap();
        match follower.submit(b"x".to_vec(), 1, &registry) {
            Err(ConcordError::NotLeader { leader }) => assert_eq!(leader, Some(n("n1"))),
            other => panic!("expected NotLeader, got {:?}", other.map(|(i, _)| i)),
        }
    }

    #[test]
    fn higher_term_demotes_leader() {
        let mut cluster = Cluster::new(&["n1", "n2", "n3"]);
        cluster.elect("n1");
        let registry = cluster.registry.clone();
        let leader = cluster.engines.get_mut(&n("n1")).unwrap();

        let actions = leader
            .handle(&n("n3"), &vote_request(9, "n3", 0, 0), &registry)
            .unwrap();
        assert_eq!(leader.role(), Role::Follower);
        assert_eq!(leader.current_term(), 9);
        assert!(actions.contains(&RaftAction::StopHeartbeat));
        // n1 has an entry-free log too, so n3 is up to date and gets the vote
        assert!(granted(&actions));
    }

    #[test]
    fn conflicting_suffix_is_truncated() {
        let registry = registry(&["n1", "n2", "n3"]);
        let mut follower = engine("n2");
        let stale = AppendEntries {
            term: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![
                LogEntry::new(1, 1, b"a".to_vec(), 0),
                LogEntry::new(1, 2, b"stale".to_vec(), 0),
            ],
            leader_commit: 1,
        };
        follower.handle(&n("n1"), &ClusterMessage::AppendEntries(stale), &registry).unwrap();
        assert_eq!(follower.log().last_index(), 2);
        assert_eq!(follower.commit_index(), 1);

        let fresh = AppendEntries {
            term: 2,
            prev_log_index: 1,
            prev_log_term: 1,
            entries: vec![LogEntry::new(2, 2, b"fresh".to_vec(), 0)],
            leader_commit: 1,
        };
        let actions = follower
            .handle(&n("n3"), &ClusterMessage::AppendEntries(fresh), &registry)
            .unwrap();
        assert_eq!(follower.log().get(2).unwrap().command, b"fresh".to_vec());
        assert_eq!(follower.log().last_term(), 2);
        assert_eq!(follower.leader_id(), Some(&n("n3")));
        assert!(actions.iter().any(|a| matches!(
            a,
            RaftAction::Send { message: ClusterMessage::AppendResponse(AppendResponse { success: true, match_index: 2, .. }), .. }
        )));
    }

    #[test]
    fn committed_entries_are_never_overwritten() {
        let registry = registry(&["n1", "n2", "n3"]);
        let mut follower = engine("n2");
        let first = AppendEntries {
            term: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![LogEntry::new(1, 1, b"kept".to_vec(), 0)],
            leader_commit: 1,
        };
        follower.handle(&n("n1"), &ClusterMessage::AppendEntries(first), &registry).unwrap();

        let rogue = AppendEntries {
            term: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![LogEntry::new(2, 1, b"rewritten".to_vec(), 0)],
            leader_commit: 0,
        };
        let actions = follower
            .handle(&n("n3"), &ClusterMessage::AppendEntries(rogue), &registry)
            .unwrap();
        assert_eq!(follower.log().get(1).unwrap().command, b"kept".to_vec());
        assert_eq!(follower.commit_index(), 1);
        assert!(actions.iter().any(|a| matches!(a, RaftAction::ReportFault { member, .. } if *member == n("n3"))));
    }

    #[test]
    fn commit_index_never_moves_back() {
        let registry = registry(&["n1", "n2"]);
        let mut follower = engine("n2");
        let append = |commit| AppendEntries {
            term: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![
                LogEntry::new(1, 1, b"a".to_vec(), 0),
                LogEntry::new(1, 2, b"b".to_vec(), 0),
            ],
            leader_commit: commit,
        };
        follower.handle(&n("n1"), &ClusterMessage::AppendEntries(append(2)), &registry).unwrap();
        assert_eq!(follower.commit_index(), 2);
        follower.handle(&n("n1"), &ClusterMessage::AppendEntries(append(1)), &registry).unwrap();
        assert_eq!(follower.commit_index(), 2);
    }

    #[test]
    fn previous_term_entries_commit_only_with_current_term_entry() {
        let registry = registry(&["n1", "n2", "n3"]);
        let store = MemoryStore::new();
        let mut seeded = store.clone();
        let old = LogEntry::new(2, 1, b"old".to_vec(), 0);
        seeded
            .store(&log_key(1), serde_json::to_value(&old).unwrap(), StoreMetadata::default())
            .unwrap();
        let hard = HardState {
            current_term: 2,
            log_len: 1,
            ..HardState::default()
        };
        seeded
            .store(RAFT_STATE_KEY, serde_json::to_value(&hard).unwrap(), StoreMetadata::default())
            .unwrap();

        let mut leader = engine_with("n1", store, AppliedLog::new());
        leader.on_election_timeout(&registry).unwrap();
        let grant = ClusterMessage::VoteResponse(VoteResponse { term: 3, vote_granted: true });
        leader.handle(&n("n2"), &grant, &registry).unwrap();
        assert!(leader.is_leader());

        let ack = |index| ClusterMessage::AppendResponse(AppendResponse { term: 3, success: true, match_index: index });
        leader.handle(&n("n2"), &ack(1), &registry).unwrap();
        assert_eq!(leader.commit_index(), 0, "term-2 entry must not commit by count alone");

        leader.submit(b"new".to_vec(), 1, &registry).unwrap();
        leader.handle(&n("n2"), &ack(2), &registry).unwrap();
        assert_eq!(leader.commit_index(), 2);
        assert_eq!(leader.last_applied(), 2);
    }

    #[test]
    fn rejection_hint_backs_off_next_index() {
        let registry = registry(&["n1", "n2", "n3"]);
        let mut leader = engine("n1");
        leader.on_election_timeout(&registry).unwrap();
        let grant = ClusterMessage::VoteResponse(VoteResponse { term: 1, vote_granted: true });
        leader.handle(&n("n2"), &grant, &registry).unwrap();
        for i in 0..5 {
            leader.submit(vec![i], 1, &registry).unwrap();
        }

        let ack = ClusterMessage::AppendResponse(AppendResponse { term: 1, success: true, match_index: 4 });
        leader.handle(&n("n3"), &ack, &registry).unwrap();
        assert_eq!(leader.leader_state().unwrap().next_index[&n("n3")], 5);

        let nack = ClusterMessage::AppendResponse(AppendResponse { term: 1, success: false, match_index: 2 });
        let actions = leader.handle(&n("n3"), &nack, &registry).unwrap();
        let progress = leader.leader_state().unwrap();
        assert_eq!(progress.next_index[&n("n3")], 3);
        assert_eq!(progress.match_index[&n("n3")], 4);
        match actions.as_slice() {
            [RaftAction::Send { message: ClusterMessage::AppendEntries(req), .. }] => {
                assert_eq!(req.prev_log_index, 2);
                assert_eq!(req.entries.len(), 3);
            }
            other => panic!("unexpected actions {:?}", other),
        }
    }

    #[test]
    fn state_survives_restart() {
        let registry = registry(&["n1", "n2", "n3"]);
        let store = MemoryStore::new();
        {
            let mut engine = engine_with("n1", store.clone(), AppliedLog::new());
            engine.handle(&n("n2"), &vote_request(4, "n2", 0, 0), &registry).unwrap();
        }
        let restarted = engine_with("n1", store, AppliedLog::new());
        assert_eq!(restarted.current_term(), 4);
        assert_eq!(restarted.voted_for(), Some(&n("n2")));
        assert_eq!(restarted.role(), Role::Follower);
    }

    #[test]
    fn isolated_members_are_ignored() {
        let mut registry = registry(&["n1", "n2", "n3"]);
        registry.isolate(&n("n3"), "equivocation").unwrap();
        let mut engine = engine("n1");
        let actions = engine.handle(&n("n3"), &vote_request(5, "n3", 0, 0), &registry).unwrap();
        assert!(actions.is_empty());
        assert_eq!(engine.current_term(), 0);
    }

    #[test]
    fn minority_partition_cannot_elect() {
        let mut cluster = Cluster::new(&["n1", "n2", "n3", "n4", "n5"]);
        cluster.down.insert(n("n3"));
        cluster.down.insert(n("n4"));
        cluster.down.insert(n("n5"));
        for _ in 0..3 {
            cluster.elect("n1");
            assert!(!cluster.get("n1").is_leader());
        }
        assert_eq!(cluster.get("n1").current_term(), 3);
    }

    #[test]
    fn impersonated_vote_request_is_a_fault() {
        let registry = registry(&["n1", "n2", "n3"]);
        let mut engine = engine("n1");
        let actions = engine.handle(&n("n3"), &vote_request(1, "n2", 0, 0), &registry).unwrap();
        assert!(matches!(actions.as_slice(), [RaftAction::ReportFault { .. }]));
    }

    fn revision(store: &MemoryStore, key: &str) -> Option<u64> {
        store.retrieve(key).unwrap().map(|r| r.revision)
    }

    #[test]
    fn appends_write_only_new_entries() {
        let registry = registry(&["n1"]);
        let store = MemoryStore::new();
        let mut leader = engine_with("n1", store.clone(), AppliedLog::new());
        leader.start(&registry).unwrap();
        assert!(leader.is_leader());
        for i in 0..3 {
            leader.submit(vec![i], 1, &registry).unwrap();
        }

        for index in 1..=3 {
            assert_eq!(revision(&store, &log_key(index)), Some(1), "entry {} rewritten", index);
        }
        assert!(revision(&store, RAFT_STATE_KEY).unwrap() > 3);

        let restarted = engine_with("n1", store, AppliedLog::new());
        assert_eq!(restarted.log().last_index(), 3);
        assert_eq!(restarted.commit_index(), leader.commit_index());
        let commit = restarted.commit_index();
        assert!(restarted.log().iter().all(|e| e.committed == (e.index <= commit)));
    }

    #[test]
    fn truncated_suffix_is_not_reloaded() {
        let registry = registry(&["n1", "n2", "n3"]);
        let store = MemoryStore::new();
        let mut follower = engine_with("n2", store.clone(), AppliedLog::new());
        let first = AppendEntries {
            term: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: (1..=3).map(|i| LogEntry::new(1, i, vec![i as u8], 0)).collect(),
            leader_commit: 1,
        };
        follower.handle(&n("n1"), &ClusterMessage::AppendEntries(first), &registry).unwrap();
        let second = AppendEntries {
            term: 2,
            prev_log_index: 1,
            prev_log_term: 1,
            entries: vec![LogEntry::new(2, 2, b"new".to_vec(), 0)],
            leader_commit: 1,
        };
        follower.handle(&n("n3"), &ClusterMessage::AppendEntries(second), &registry).unwrap();
        assert_eq!(follower.log().last_index(), 2);
        assert_eq!(revision(&store, &log_key(1)), Some(1));
        assert_eq!(revision(&store, &log_key(2)), Some(2));

        let restarted = engine_with("n2", store, AppliedLog::new());
        assert_eq!(restarted.log().last_index(), 2);
        assert_eq!(restarted.log().get(2).unwrap().command, b"new".to_vec());
        assert_eq!(restarted.current_term(), 2);
    }

    #[test]
    fn replayed_append_entries_change_nothing() {
        let registry = registry(&["n1", "n2", "n3"]);
        let store = MemoryStore::new();
        let mut follower = engine_with("n2", store.clone(), AppliedLog::new());
        let append = AppendEntries {
            term: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![
                LogEntry::new(1, 1, b"a".to_vec(), 0),
                LogEntry::new(1, 2, b"b".to_vec(), 0),
            ],
            leader_commit: 1,
        };
        let message = ClusterMessage::AppendEntries(append.clone());
        follower.handle(&n("n1"), &message, &registry).unwrap();
        let state_writes = revision(&store, RAFT_STATE_KEY);

        let actions = follower.handle(&n("n1"), &message, &registry).unwrap();
        assert!(actions.iter().any(|a| matches!(
            a,
            RaftAction::Send { message: ClusterMessage::AppendResponse(AppendResponse { success: true, match_index: 2, .. }), .. }
        )));
        assert_eq!(follower.log().last_index(), 2);
        assert_eq!(follower.commit_index(), 1);
        assert_eq!(revision(&store, RAFT_STATE_KEY), state_writes);
        assert_eq!(revision(&store, &log_key(2)), Some(1));

        // an older, shorter copy arriving late keeps the suffix
        let shorter = AppendEntries {
            entries: append.entries[..1].to_vec(),
            leader_commit: 0,
            ..append
        };
        follower
            .handle(&n("n1"), &ClusterMessage::AppendEntries(shorter), &registry)
            .unwrap();
        assert_eq!(follower.log().last_index(), 2);
        assert_eq!(follower.commit_index(), 1);
    }

    #[test]
    fn late_append_responses_never_regress_progress() {
        let registry = registry(&["n1", "n2", "n3"]);
        let mut leader = engine("n1");
        leader.on_election_timeout(&registry).unwrap();
        let grant = ClusterMessage::VoteResponse(VoteResponse { term: 1, vote_granted: true });
        leader.handle(&n("n2"), &grant, &registry).unwrap();
        for i in 0..3 {
            leader.submit(vec![i], 1, &registry).unwrap();
        }

        let ack = |index| ClusterMessage::AppendResponse(AppendResponse { term: 1, success: true, match_index: index });
        leader.handle(&n("n2"), &ack(3), &registry).unwrap();
        assert_eq!(leader.commit_index(), 3);

        // duplicated and reordered acknowledgements
        leader.handle(&n("n2"), &ack(1), &registry).unwrap();
        leader.handle(&n("n2"), &ack(3), &registry).unwrap();
        let progress = leader.leader_state().unwrap();
        assert_eq!(progress.match_index[&n("n2")], 3);
        assert_eq!(progress.next_index[&n("n2")], 4);

        let old_term = ClusterMessage::AppendResponse(AppendResponse { term: 0, success: false, match_index: 0 });
        leader.handle(&n("n2"), &old_term, &registry).unwrap();
        assert_eq!(leader.leader_state().unwrap().match_index[&n("n2")], 3);
        assert_eq!(leader.commit_index(), 3);
        assert!(leader.is_leader());
    }

    #[test]
    fn local_isolation_shrinks_the_denominator() {
        let grant = ClusterMessage::VoteResponse(VoteResponse { term: 1, vote_granted: true });

        let full = registry(&["n1", "n2", "n3", "n4"]);
        let mut unaware = engine("n1");
        unaware.on_election_timeout(&full).unwrap();
        unaware.handle(&n("n2"), &grant, &full).unwrap();
        assert!(!unaware.is_leader(), "two of four voters is no majority");

        let mut trimmed = registry(&["n1", "n2", "n3", "n4"]);
        trimmed.isolate(&n("n3"), "equivocation").unwrap();
        trimmed.isolate(&n("n4"), "equivocation").unwrap();
        let mut aware = engine("n1");
        aware.on_election_timeout(&trimmed).unwrap();
        aware.handle(&n("n2"), &grant, &trimmed).unwrap();
        assert!(aware.is_leader(), "two of two voters after local isolation");
    }
}
