use async_trait::async_trait;

use concord_common::NodeId;

use crate::message::{ClusterMessage, NetworkError};

/// Outbound side of the cluster network.
///
/// Delivery is at-most-once and unordered; callers never assume a message
/// arrived.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identity stamped on every outgoing envelope.
    fn local_id(&self) -> &NodeId;

    async fn broadcast(&self, message: ClusterMessage) -> Result<(), NetworkError>;

    async fn send(&self, to: &NodeId, message: ClusterMessage) -> Result<(), NetworkError>;
}
