//! Weighted quorum voting.
//!
//! Rounds are opened over an arbitrary proposal, collect weighted votes from
//! eligible members and move out of `active` exactly once. The engine does
//! not pick thresholds; callers choose a simple or super majority.

mod engine;
pub mod evaluator;
mod round;

pub use engine::{CastOutcome, QuorumEngine, RejectReason};
pub use evaluator::{has_majority, required_weight, weight_concentration, QuorumConfiguration};
pub use round::{RoundSummary, VotingRound};
