use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use concord_common::{
    env::{consensus::evidence::EquivocationEvidence, Member, MemberStatus},
    ConcordError, ConsensusConfig, NodeId, Result,
};
use concord_p2p::MembershipRegistry;

use super::tolerance::{can_achieve_quorum, max_tolerable_faults, FaultTolerance};

pub const THREAT_NONE: f64 = 0.0;
pub const THREAT_SUSPECTED: f64 = 0.4;
pub const THREAT_CONFIRMED: f64 = 0.8;

const FAULT_PENALTY: f64 = -0.1;
const PATTERN_PENALTY: f64 = -0.2;
const CLEAN_SCAN_CREDIT: f64 = 0.02;

/// Signals accumulated against one member.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaultRecord {
    pub faults: u32,
    pub malicious_patterns: u32,
    pub accusers: BTreeSet<NodeId>,
    pub peer_confirmed: bool,
    pub last_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    pub suspected: Vec<NodeId>,
    /// Members isolated during this scan, with the reason to broadcast.
    pub isolated: Vec<(NodeId, String)>,
    pub threat_level: f64,
}

#[derive(Debug, Clone, Copy)]
struct Thresholds {
    heartbeat_timeout_ms: u64,
    fault_count: u32,
    reputation_floor: f64,
    suspect_patterns: u32,
    confirm_patterns: u32,
}

/// Watches every member for Byzantine behaviour and isolates the ones it
/// can confirm. Isolation only removes a member from future eligibility.
#[derive(Debug)]
pub struct FaultMonitor {
    local_id: NodeId,
    thresholds: Thresholds,
    records: HashMap<NodeId, FaultRecord>,
    suspected: BTreeSet<NodeId>,
    threat_level: f64,
}

enum Verdict {
    Clean,
    Suspected(String),
    Confirmed(String),
}

impl FaultMonitor {
    pub fn new(local_id: NodeId, config: &ConsensusConfig) -> Self {
        Self {
            local_id,
            thresholds: Thresholds {
                heartbeat_timeout_ms: config.heartbeat_timeout_ms,
                fault_count: config.fault_count_threshold,
                reputation_floor: config.reputation_floor,
                suspect_patterns: config.suspect_pattern_threshold,
                confirm_patterns: config.confirm_pattern_threshold,
            },
            records: HashMap::new(),
            suspected: BTreeSet::new(),
            threat_level: THREAT_NONE,
        }
    }

    fn record_mut(&mut self, member: &NodeId) -> Option<&mut FaultRecord> {
        if *member == self.local_id {
            return None;
        }
        Some(self.records.entry(member.clone()).or_default())
    }

    /// A protocol fault such as a stale-term append or a refused truncation.
    pub fn report_fault(&mut self, registry: &mut MembershipRegistry, member: &NodeId, reason: &str) {
        if !registry.contains(member) {
            return;
        }
        let Some(record) = self.record_mut(member) else {
            return;
        };
        record.faults += 1;
        record.last_reason = Some(reason.to_string());
        let faults = record.faults;
        registry.adjust_reputation(member, FAULT_PENALTY);
        debug!("Fault #{} from {}: {}", faults, member, reason);
    }

    /// An externally observed malicious pattern.
    pub fn report_malicious_pattern(
        &mut self,
        registry: &mut MembershipRegistry,
        member: &NodeId,
        reason: &str,
    ) {
        if !registry.contains(member) {
            return;
        }
        let Some(record) = self.record_mut(member) else {
            return;
        };
        record.malicious_patterns += 1;
        record.last_reason = Some(reason.to_string());
        let patterns = record.malicious_patterns;
        registry.adjust_reputation(member, PATTERN_PENALTY);
        warn!("🚨 Malicious pattern #{} from {}: {}", patterns, member, reason);
    }

    pub fn report_equivocation(
        &mut self,
        registry: &mut MembershipRegistry,
        evidence: &EquivocationEvidence,
    ) {
        let reason = format!(
            "equivocation in round {} ({} then {})",
            evidence.round_id, evidence.vote_a, evidence.vote_b
        );
        self.report_malicious_pattern(registry, evidence.offender(), &reason);
    }

    /// Counts a remote `Suspect` notice. Returns true once more than `f`
    /// distinct non-malicious members accused `accused`; the member is then
    /// isolated on the next scan.
    pub fn record_accusation(
        &mut self,
        registry: &MembershipRegistry,
        accuser: &NodeId,
        accused: &NodeId,
        reason: &str,
    ) -> bool {
        if accuser == accused || !registry.contains(accused) {
            return false;
        }
        match registry.get(accuser).map(|m| m.status) {
            None | Some(MemberStatus::Malicious) => {
                debug!("Ignoring accusation against {} from {}", accused, accuser);
                return false;
            }
            _ => {}
        }

        let f = max_tolerable_faults(registry.member_count());
        let Some(record) = self.record_mut(accused) else {
            return false;
        };
        record.accusers.insert(accuser.clone());
        // drop accusers isolated since they spoke
        record.accusers.retain(|a| {
            registry
                .get(a)
                .map(|m| m.status != MemberStatus::Malicious)
                .unwrap_or(false)
        });
        if record.accusers.len() > f && !record.peer_confirmed {
            record.peer_confirmed = true;
            record.last_reason = Some(format!("confirmed by peers: {reason}"));
            info!(
                "Suspicion of {} confirmed by {} peers",
                accused,
                record.accusers.len()
            );
        }
        record.peer_confirmed
    }

    fn evaluate(&self, member: &Member, now_ms: u64) -> Verdict {
        let record = self.records.get(&member.id);
        let patterns = record.map_or(0, |r| r.malicious_patterns);
        let faults = record.map_or(0, |r| r.faults);
        let reason = || {
            record
                .and_then(|r| r.last_reason.clone())
                .unwrap_or_else(|| "unspecified".to_string())
        };

        if patterns > self.thresholds.confirm_patterns {
            return Verdict::Confirmed(format!("{} malicious patterns: {}", patterns, reason()));
        }
        if record.map_or(false, |r| r.peer_confirmed) {
            return Verdict::Confirmed(reason());
        }

        let silence = now_ms.saturating_sub(member.last_heartbeat_ms);
        if silence > self.thresholds.heartbeat_timeout_ms {
            return Verdict::Suspected(format!("no heartbeat for {}ms", silence));
        }
        if faults > self.thresholds.fault_count {
            return Verdict::Suspected(format!("{} protocol faults", faults));
        }
        if member.reputation < self.thresholds.reputation_floor {
            return Verdict::Suspected(format!("reputation {:.2}", member.reputation));
        }
        if patterns > self.thresholds.suspect_patterns {
            return Verdict::Suspected(format!("{} malicious patterns", patterns));
        }
        Verdict::Clean
    }

    /// One pass over every member. Confirmed members are isolated in the
    /// registry and listed in the report so the caller can broadcast them.
    pub fn scan(&mut self, registry: &mut MembershipRegistry, now_ms: u64) -> ScanReport {
        let mut report = ScanReport::default();
        let mut clean = Vec::new();
        let mut confirmed = Vec::new();
        let mut threat = THREAT_NONE;

        for member in registry.members() {
            if member.id == self.local_id || member.status == MemberStatus::Leaving {
                continue;
            }
            if member.status == MemberStatus::Malicious {
                threat = threat.max(THREAT_CONFIRMED);
                continue;
            }
            match self.evaluate(member, now_ms) {
                Verdict::Clean => clean.push(member.id.clone()),
                Verdict::Suspected(reason) => {
                    threat = threat.max(THREAT_SUSPECTED);
                    if !self.suspected.contains(&member.id) {
                        warn!("🔍 Suspecting {}: {}", member.id, reason);
                    }
                    report.suspected.push(member.id.clone());
                }
                Verdict::Confirmed(reason) => {
                    threat = threat.max(THREAT_CONFIRMED);
                    confirmed.push((member.id.clone(), reason));
                }
            }
        }

        for id in &clean {
            registry.adjust_reputation(id, CLEAN_SCAN_CREDIT);
        }
        for (id, reason) in confirmed {
            if let Ok(true) = self.isolate(registry, &id, &reason) {
                report.isolated.push((id, reason));
            }
        }

        self.suspected = report.suspected.iter().cloned().collect();
        self.threat_level = threat;
        report.threat_level = threat;
        report
    }

    /// Isolates `member` now. Returns whether its status changed.
    pub fn isolate(
        &mut self,
        registry: &mut MembershipRegistry,
        member: &NodeId,
        reason: &str,
    ) -> Result<bool> {
        if member.is_empty() {
            return Err(ConcordError::MissingIdentifier("member id"));
        }
        if *member == self.local_id {
            warn!("Refusing to isolate the local node");
            return Ok(false);
        }
        let changed = !matches!(
            registry.isolate(member, reason)?,
            concord_p2p::MemberEvent::NoChange
        );
        self.suspected.remove(member);
        if changed {
            self.threat_level = self.threat_level.max(THREAT_CONFIRMED);
        }
        Ok(changed)
    }

    /// Clears the history of a member re-admitted or removed by a vote.
    pub fn forget(&mut self, member: &NodeId) {
        self.records.remove(member);
        self.suspected.remove(member);
    }

    pub fn threat_level(&self) -> f64 {
        self.threat_level
    }

    pub fn suspected(&self) -> &BTreeSet<NodeId> {
        &self.suspected
    }

    pub fn record(&self, member: &NodeId) -> Option<&FaultRecord> {
        self.records.get(member)
    }

    pub fn fault_tolerance(&self, registry: &MembershipRegistry) -> FaultTolerance {
        FaultTolerance::from_registry(registry)
    }

    pub fn can_achieve_quorum(&self, registry: &MembershipRegistry, threshold: f64) -> bool {
        can_achieve_quorum(registry, threshold)
    }
}
