use serde::{Deserialize, Serialize};
use thiserror::Error;

use concord_common::{
    env::{LogEntry, LogIndex, Proposal, RoundId, RoundStatus, Term, VoteData},
    ConcordError, NodeId,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVote {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntries {
    pub term: Term,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

/// On failure `match_index` carries the follower's hint of the highest index
/// that may still match, so the leader can back off `next_index` in one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendResponse {
    pub term: Term,
    pub success: bool,
    pub match_index: LogIndex,
}

/// Everything coordination nodes say to each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterMessage {
    RequestVote(RequestVote),
    VoteResponse(VoteResponse),
    AppendEntries(AppendEntries),
    AppendResponse(AppendResponse),
    Propose(Proposal),
    Vote(VoteData),
    /// Carries the approved proposal so it applies even where the
    /// `Propose` has not arrived yet.
    Commit { proposal: Proposal },
    Abort { round_id: RoundId, status: RoundStatus },
    Suspect { member_id: NodeId, reason: String },
    Heartbeat { member_id: NodeId, timestamp: u64 },
}

impl ClusterMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterMessage::RequestVote(_) => "request_vote",
            ClusterMessage::VoteResponse(_) => "vote_response",
            ClusterMessage::AppendEntries(_) => "append_entries",
            ClusterMessage::AppendResponse(_) => "append_response",
            ClusterMessage::Propose(_) => "propose",
            ClusterMessage::Vote(_) => "vote",
            ClusterMessage::Commit { .. } => "commit",
            ClusterMessage::Abort { .. } => "abort",
            ClusterMessage::Suspect { .. } => "suspect",
            ClusterMessage::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// A message tagged with its sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub message: ClusterMessage,
}

impl Envelope {
    pub fn new(from: NodeId, message: ClusterMessage) -> Self {
        Self { from, message }
    }
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Failed to send message to peer {0}")]
    SendError(String),
    #[error("Peer {0} not found")]
    PeerNotFound(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<NetworkError> for ConcordError {
    fn from(e: NetworkError) -> Self {
        ConcordError::Network(e.to_string())
    }
}
