//! Shared types for the concord coordination cluster.
//!
//! Every crate in the workspace speaks in terms of these identifiers,
//! data-model records and the common error type.

pub mod config;
pub mod env;
pub mod error;
pub mod utils;

pub use config::ConsensusConfig;
pub use error::{ConcordError, Result};
pub use utils::NodeId;
