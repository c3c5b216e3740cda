pub mod consensus;
pub mod log_entry;
pub mod member;
pub mod proposal;
pub mod vote_data;

pub use consensus::types::{RoundId, RoundStatus, Vote};
pub use log_entry::{LogEntry, LogIndex, Term};
pub use member::{Member, MemberStatus};
pub use proposal::{ChangeType, MembershipChange, Proposal, ProposalKind};
pub use vote_data::VoteData;
