use serde::{Deserialize, Serialize};

/// Raft election epoch.
pub type Term = u64;

/// 1-based position in the replicated log. Index 0 is the empty-log sentinel.
pub type LogIndex = u64;

/// An entry of the replicated log. The command is an opaque payload that is
/// never modified once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub command: Vec<u8>,
    #[serde(default)]
    pub committed: bool,
    pub timestamp: u64,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, command: Vec<u8>, timestamp: u64) -> Self {
        Self {
            term,
            index,
            command,
            committed: false,
            timestamp,
        }
    }
}
