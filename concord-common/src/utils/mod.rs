//! utils.rs
//!
//! Identifiers and small helpers shared across the cluster crates.

pub mod node_id;
pub use node_id::NodeId;

pub mod time;
