//! Raft leader election and log replication.
//!
//! The engine is synchronous and never touches a clock or socket: every
//! entry point returns the [`RaftAction`]s the caller must carry out
//! (messages to send, timers to arm or cancel, faults to report).
//!
//! Majorities are counted over `MembershipRegistry::voters()` of the local
//! node. That set shrinks when this node isolates a member or a member is
//! voted out, and isolation is decided locally from the accusations and
//! faults this node has seen. Until every node has reached the same
//! isolation decisions, two nodes can count a majority against different
//! denominators. Safety then rests on isolation requiring more than `f`
//! independent accusers, so honest nodes converge on the same electorate.
//!
//! State is persisted under [`RAFT_STATE_KEY`] (term, vote, commit point and
//! log length) plus one key per log entry ([`log_key`]), written before any
//! response that depends on it. Only entries that changed are rewritten.

mod engine;
mod log;
mod state;
mod state_machine;

pub use engine::{log_key, RaftAction, RaftEngine, RAFT_STATE_KEY};
pub use log::RaftLog;
pub use state::{HardState, LeaderState, NodeState, PersistentState, Role};
pub use state_machine::{AppliedLog, StateMachine};
