//! Boundary to the gossip transport.
//!
//! The transport owns the wire protocol, anti-entropy and failure
//! detection. This node only needs four things from it: join, leave,
//! a stream of peer state changes, and a way to publish its own load.

use std::net::SocketAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::NodeId;

/// Payload each node gossips about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeLoad {
    /// Upstream connections held locally.
    pub connections: usize,
}

/// A peer's self-reported state as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerUpdate {
    pub node_id: NodeId,
    pub advertise_addr: String,
    pub load: NodeLoad,
    /// When the peer produced this state (ms since epoch).
    pub timestamp_ms: u64,
}

/// Membership change delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A peer published new state.
    Updated(PeerUpdate),
    /// A peer announced departure or was declared dead.
    Left(NodeId),
}

/// Errors surfaced by a gossip transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// None of the given targets admitted this node.
    #[error("no join target reachable: {0}")]
    Unreachable(String),

    /// The operation needs cluster membership first.
    #[error("not a cluster member")]
    NotJoined,

    /// The transport has been shut down.
    #[error("transport shut down")]
    ShutDown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Gossip transport consumed by the node.
#[async_trait]
pub trait GossipTransport: Send + Sync + 'static {
    /// Contacts `targets` and asks to be admitted.
    ///
    /// Returns the number of targets that admitted this node. Fails with
    /// [`TransportError::Unreachable`] when none did.
    async fn join(&self, targets: &[SocketAddr]) -> Result<usize, TransportError>;

    /// Announces departure to known peers.
    async fn leave(&self) -> Result<(), TransportError>;

    /// Publishes this node's load for dissemination on the next round.
    async fn publish(&self, load: NodeLoad) -> Result<(), TransportError>;

    /// Returns a stream of peer events. Each call yields a new receiver.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<PeerEvent>;
}
