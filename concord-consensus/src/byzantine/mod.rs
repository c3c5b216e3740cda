//! Byzantine fault detection and isolation.

mod monitor;
mod tolerance;

pub use monitor::{FaultMonitor, FaultRecord, ScanReport, THREAT_CONFIRMED, THREAT_NONE, THREAT_SUSPECTED};
pub use tolerance::{can_achieve_quorum, max_tolerable_faults, FaultTolerance};
