use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use concord_common::{
    env::{LogIndex, Term},
    NodeId,
};

use super::log::RaftLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        };
        write!(f, "{}", s)
    }
}

/// What must survive a restart. Written before any response that depends
/// on it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub log: RaftLog,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
}

impl PersistentState {
    pub fn hard_state(&self) -> HardState {
        HardState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            log_len: self.log.last_index(),
        }
    }
}

/// The fixed-size part of [`PersistentState`]. Log entries are stored one
/// per key next to it; `log_len` says how many of them are live, so a
/// truncated suffix needs no deletes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub log_len: LogIndex,
}

/// Replication progress the leader keeps per follower.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeaderState {
    pub next_index: BTreeMap<NodeId, LogIndex>,
    pub match_index: BTreeMap<NodeId, LogIndex>,
}

/// Everything a node knows about its own Raft state. Owned by the engine
/// and changed only through its message entry points.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub persistent: PersistentState,
    pub role: Role,
    pub leader_id: Option<NodeId>,
    pub votes_received: BTreeSet<NodeId>,
    pub leader: Option<LeaderState>,
}

impl NodeState {
    pub fn from_persistent(persistent: PersistentState) -> Self {
        Self {
            persistent,
            role: Role::Follower,
            leader_id: None,
            votes_received: BTreeSet::new(),
            leader: None,
        }
    }
}
