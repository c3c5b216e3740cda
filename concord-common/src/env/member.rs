//! member.rs
//!
//! The cluster member record owned by the membership registry.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::utils::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberStatus {
    Active,
    Suspected,
    Inactive,
    Joining,
    Leaving,
    Malicious,
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemberStatus::Active => "active",
            MemberStatus::Suspected => "suspected",
            MemberStatus::Inactive => "inactive",
            MemberStatus::Joining => "joining",
            MemberStatus::Leaving => "leaving",
            MemberStatus::Malicious => "malicious",
        };
        write!(f, "{}", s)
    }
}

/// A coordination node as seen by the local membership view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,

    /// Voting power in weighted rounds. Always positive.
    pub weight: u64,

    pub status: MemberStatus,

    /// Local monotonic time (ms) of the last heartbeat received.
    pub last_heartbeat_ms: u64,

    /// Latest sender timestamp seen in a heartbeat, used to drop replays.
    #[serde(default)]
    pub last_heartbeat_stamp: u64,

    /// 0..=1, grows with heartbeats and decays on staleness.
    pub reliability: f64,

    /// 0..=1, driven by the fault monitor.
    pub reputation: f64,
}

impl Member {
    pub fn new(id: NodeId, weight: u64, status: MemberStatus, now_ms: u64) -> Self {
        Self {
            id,
            weight,
            status,
            last_heartbeat_ms: now_ms,
            last_heartbeat_stamp: 0,
            reliability: 1.0,
            reputation: 1.0,
        }
    }

    /// Whether the member may vote in weighted rounds.
    pub fn is_eligible(&self) -> bool {
        self.status == MemberStatus::Active
    }

    /// Whether the member counts in the Raft electorate.
    pub fn is_voter(&self) -> bool {
        !matches!(self.status, MemberStatus::Malicious | MemberStatus::Leaving)
    }

    pub fn is_faulty(&self) -> bool {
        matches!(
            self.status,
            MemberStatus::Malicious | MemberStatus::Inactive | MemberStatus::Suspected
        )
    }
}
