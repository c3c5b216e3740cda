//! Coordination core: weighted quorum voting, Byzantine fault monitoring and
//! Raft log replication over a shared membership view.

pub mod byzantine;
pub mod quorum;
pub mod raft;
pub mod storage;

pub use byzantine::{FaultMonitor, FaultTolerance, ScanReport};
pub use quorum::{CastOutcome, QuorumConfiguration, QuorumEngine, VotingRound};
pub use raft::{RaftAction, RaftEngine, Role, StateMachine};
pub use storage::{FileStore, MemoryStore, Persistence};
