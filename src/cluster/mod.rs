//! Cluster membership.
//!
//! Tracks which nodes exist and how loaded they are, and drives this
//! node's join at startup. The gossip transport itself sits behind
//! [`GossipTransport`]; [`MemoryTransport`] is the in-process
//! implementation.

mod directory;
mod join;
mod memory;
mod node_id;
mod transport;

pub use directory::{now_ms, ClusterDirectory, ClusterSnapshot, LoadAverage, PeerState};
pub use join::{resolve_targets, Backoff, JoinAttempt, JoinCoordinator, JoinError, JoinOutcome, JoinState};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use node_id::NodeId;
pub use transport::{GossipTransport, NodeLoad, PeerEvent, PeerUpdate, TransportError};
