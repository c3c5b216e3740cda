pub mod codec;
pub mod in_memory;
pub mod membership;
pub mod message;
pub mod ports;

pub use in_memory::{InMemoryNetwork, InMemoryTransport};
pub use membership::{MemberEvent, MembershipRegistry};
pub use message::{ClusterMessage, Envelope, NetworkError};
pub use ports::Transport;
