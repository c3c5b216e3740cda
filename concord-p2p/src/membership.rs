//! membership.rs
//!
//! Authoritative view of cluster members, their voting weight, liveness and
//! trust state. The quorum, fault-monitor and replication engines read this
//! view; only heartbeat handling, isolation and applied membership changes
//! write to it.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use concord_common::{
    env::{Member, MemberStatus},
    ConcordError, NodeId, Result,
};

const RELIABILITY_STEP: f64 = 0.1;
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MemberEvent {
    Registered { id: NodeId, weight: u64 },
    WeightChanged { id: NodeId, from: u64, to: u64 },
    StatusChanged { id: NodeId, from: MemberStatus, to: MemberStatus },
    Isolated { id: NodeId, reason: String },
    Removed(NodeId),
    NoChange,
}

impl MemberEvent {
    /// Whether the event can change quorum or commit denominators.
    pub fn alters_electorate(&self) -> bool {
        !matches!(self, MemberEvent::NoChange)
    }
}

#[derive(Debug, Clone)]
pub struct MembershipRegistry {
    members: BTreeMap<NodeId, Member>,
    notifier: broadcast::Sender<MemberEvent>,
}

impl Default for MembershipRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MembershipRegistry {
    pub fn new() -> Self {
        let (notifier, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            members: BTreeMap::new(),
            notifier,
        }
    }

    /// Change notifications. The coordinator drains one receiver after each
    /// entry point.
    pub fn subscribe(&self) -> broadcast::Receiver<MemberEvent> {
        self.notifier.subscribe()
    }

    fn emit(&self, event: MemberEvent) -> MemberEvent {
        if event.alters_electorate() {
            // no receivers is fine
            let _ = self.notifier.send(event.clone());
        }
        event
    }

    fn set_status(&mut self, id: &NodeId, to: MemberStatus) -> MemberEvent {
        let Some(member) = self.members.get_mut(id) else {
            return MemberEvent::NoChange;
        };
        let from = member.status;
        if from == to {
            return MemberEvent::NoChange;
        }
        member.status = to;
        debug!("Member {} status {} -> {}", id, from, to);
        self.emit(MemberEvent::StatusChanged { id: id.clone(), from, to })
    }

    /// Adds a member as active, or updates the weight of an existing one.
    pub fn upsert_member(&mut self, id: NodeId, weight: u64, now_ms: u64) -> Result<MemberEvent> {
        self.insert_with_status(id, weight, now_ms, MemberStatus::Active)
    }

    /// Adds a member approved by a membership vote. It stays `joining` until
    /// its first heartbeat. A previously isolated member is re-admitted the
    /// same way.
    pub fn stage_join(&mut self, id: NodeId, weight: u64, now_ms: u64) -> Result<MemberEvent> {
        if let Some(member) = self.members.get_mut(&id) {
            if member.status == MemberStatus::Malicious {
                member.weight = weight;
                member.reputation = 0.5;
                member.last_heartbeat_ms = now_ms;
                info!("♻️ Re-admitting isolated member {}", id);
                return Ok(self.set_status(&id, MemberStatus::Joining));
            }
        }
        self.insert_with_status(id, weight, now_ms, MemberStatus::Joining)
    }

    fn insert_with_status(
        &mut self,
        id: NodeId,
        weight: u64,
        now_ms: u64,
        status: MemberStatus,
    ) -> Result<MemberEvent> {
        if id.is_empty() {
            return Err(ConcordError::MissingIdentifier("member id"));
        }
        if weight == 0 {
            return Err(ConcordError::InvalidWeight(weight));
        }

        if let Some(member) = self.members.get_mut(&id) {
            if member.weight == weight {
                return Ok(MemberEvent::NoChange);
            }
            let from = member.weight;
            member.weight = weight;
            info!("⚖️ Member {} weight {} -> {}", id, from, weight);
            return Ok(self.emit(MemberEvent::WeightChanged { id, from, to: weight }));
        }

        info!("➕ Registering member {} (weight {}, {})", id, weight, status);
        self.members
            .insert(id.clone(), Member::new(id.clone(), weight, status, now_ms));
        Ok(self.emit(MemberEvent::Registered { id, weight }))
    }

    /// Records a liveness heartbeat. `stamp` is the sender's own timestamp;
    /// replays older than the newest seen stamp are ignored.
    pub fn record_heartbeat(&mut self, id: &NodeId, now_ms: u64, stamp: u64) -> MemberEvent {
        let Some(member) = self.members.get_mut(id) else {
            debug!("Heartbeat from unknown member {}", id);
            return MemberEvent::NoChange;
        };
        if stamp != 0 && stamp < member.last_heartbeat_stamp {
            debug!("Stale heartbeat from {} ignored", id);
            return MemberEvent::NoChange;
        }
        member.last_heartbeat_stamp = member.last_heartbeat_stamp.max(stamp);
        member.last_heartbeat_ms = member.last_heartbeat_ms.max(now_ms);
        member.reliability = (member.reliability + RELIABILITY_STEP).min(1.0);

        match member.status {
            MemberStatus::Malicious | MemberStatus::Leaving | MemberStatus::Active => {
                MemberEvent::NoChange
            }
            _ => self.set_status(id, MemberStatus::Active),
        }
    }

    /// Demotes members whose last heartbeat is older than the timeout:
    /// `inactive` past one timeout, `suspected` past three.
    pub fn sweep_staleness(&mut self, now_ms: u64, heartbeat_timeout_ms: u64) -> Vec<MemberEvent> {
        let mut demotions = Vec::new();
        for member in self.members.values_mut() {
            if matches!(member.status, MemberStatus::Malicious | MemberStatus::Leaving) {
                continue;
            }
            let silence = now_ms.saturating_sub(member.last_heartbeat_ms);
            if silence <= heartbeat_timeout_ms {
                continue;
            }
            member.reliability = (member.reliability - RELIABILITY_STEP).max(0.0);

            let target = if silence > heartbeat_timeout_ms.saturating_mul(3) {
                MemberStatus::Suspected
            } else {
                MemberStatus::Inactive
            };
            // never promote a suspected member back to inactive
            if member.status != target && member.status != MemberStatus::Suspected {
                demotions.push((member.id.clone(), target));
            }
        }

        demotions
            .into_iter()
            .map(|(id, status)| {
                warn!("💤 Member {} silent past heartbeat timeout, now {}", id, status);
                self.set_status(&id, status)
            })
            .collect()
    }

    /// Excludes a member from every quorum and election until it is
    /// re-admitted by a membership vote.
    pub fn isolate(&mut self, id: &NodeId, reason: &str) -> Result<MemberEvent> {
        if id.is_empty() {
            return Err(ConcordError::MissingIdentifier("member id"));
        }
        let member = self
            .members
            .get_mut(id)
            .ok_or_else(|| ConcordError::UnknownMember(id.clone()))?;
        if member.status == MemberStatus::Malicious {
            return Ok(MemberEvent::NoChange);
        }
        member.status = MemberStatus::Malicious;
        member.reputation = 0.0;
        warn!("⛔ Isolating member {}: {}", id, reason);
        tracing::warn!(target: "consensus", "EVENT:ISOLATE member={} reason={}", id, reason);
        Ok(self.emit(MemberEvent::Isolated {
            id: id.clone(),
            reason: reason.to_string(),
        }))
    }

    /// Takes a member voted out of the cluster out of the electorate. Used
    /// when the removal targets the local node, which keeps its own entry.
    pub fn mark_leaving(&mut self, id: &NodeId) -> MemberEvent {
        match self.members.get(id).map(|m| m.status) {
            Some(MemberStatus::Malicious) | None => MemberEvent::NoChange,
            Some(_) => self.set_status(id, MemberStatus::Leaving),
        }
    }

    pub fn remove_member(&mut self, id: &NodeId) -> Result<MemberEvent> {
        if id.is_empty() {
            return Err(ConcordError::MissingIdentifier("member id"));
        }
        match self.members.remove(id) {
            Some(_) => {
                info!("➖ Removed member {}", id);
                Ok(self.emit(MemberEvent::Removed(id.clone())))
            }
            None => Err(ConcordError::UnknownMember(id.clone())),
        }
    }

    /// Shifts a member's reputation by `delta`, clamped to [0, 1].
    pub fn adjust_reputation(&mut self, id: &NodeId, delta: f64) -> Option<f64> {
        let member = self.members.get_mut(id)?;
        member.reputation = (member.reputation + delta).clamp(0.0, 1.0);
        Some(member.reputation)
    }

    pub fn get(&self, id: &NodeId) -> Option<&Member> {
        self.members.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.members.contains_key(id)
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// Active, non-malicious members may vote in weighted rounds.
    pub fn eligible(&self, id: &NodeId) -> bool {
        self.members.get(id).map(Member::is_eligible).unwrap_or(false)
    }

    pub fn eligible_members(&self) -> impl Iterator<Item = &Member> {
        self.members.values().filter(|m| m.is_eligible())
    }

    /// Sum of the weights of eligible members (the quorum denominator).
    pub fn eligible_weight(&self) -> u64 {
        self.eligible_members().map(|m| m.weight).sum()
    }

    /// Weight of every member that is not on its way out.
    pub fn membership_weight(&self) -> u64 {
        self.members
            .values()
            .filter(|m| m.status != MemberStatus::Leaving)
            .map(|m| m.weight)
            .sum()
    }

    /// Raft electorate. Stale members stay counted; only isolated or
    /// departing members leave the denominator.
    pub fn voters(&self) -> BTreeSet<NodeId> {
        self.members
            .values()
            .filter(|m| m.is_voter())
            .map(|m| m.id.clone())
            .collect()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn active_count(&self) -> usize {
        self.eligible_members().count()
    }

    pub fn count_with_status(&self, status: MemberStatus) -> usize {
        self.members.values().filter(|m| m.status == status).count()
    }

    pub fn faulty_count(&self) -> usize {
        self.members.values().filter(|m| m.is_faulty()).count()
    }
}
