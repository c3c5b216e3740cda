use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A member's decision on a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vote {
    Yes,
    No,
    Abstain,
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Vote::Yes => "Yes",
            Vote::No => "No",
            Vote::Abstain => "Abstain",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle of a weighted voting round. Only `Active` is non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoundStatus {
    Active,
    Passed,
    Failed,
    Timeout,
}

impl RoundStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RoundStatus::Active)
    }
}

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoundStatus::Active => "active",
            RoundStatus::Passed => "passed",
            RoundStatus::Failed => "failed",
            RoundStatus::Timeout => "timeout",
        };
        write!(f, "{}", s)
    }
}

/// Identity of a voting round. Generated once by the proposer and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoundId(pub Uuid);

impl RoundId {
    pub fn generate() -> Self {
        RoundId(Uuid::new_v4())
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
