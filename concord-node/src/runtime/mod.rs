//! Node runtime: the pure [`coordinator::Coordinator`] plus the tokio loop
//! ([`maestro::Maestro`]) that feeds it messages, timers and commands.

pub mod builder;
pub mod coordinator;
pub mod maestro;
pub mod timers;

pub use builder::{build_runtime, open_store, NodeRuntime};
pub use coordinator::{
    ApproveAll, Coordinator, Effects, HealthReport, Outbound, RejectAll, TimerCommand, TimerKind,
    VotePolicy,
};
pub use maestro::{Maestro, MaestroCommand, MaestroHandle};
