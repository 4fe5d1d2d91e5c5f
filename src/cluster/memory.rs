//! In-process gossip transport.
//!
//! Nodes sharing a [`MemoryNetwork`] reach each other by gossip address
//! without touching a socket. Published state is delivered to every other
//! member immediately, which makes the network a convenient stand-in for
//! the real transport in tests and single-process deployments.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::directory::now_ms;
use super::transport::{GossipTransport, NodeLoad, PeerEvent, PeerUpdate, TransportError};
use super::NodeId;

#[derive(Debug)]
struct Member {
    node_id: NodeId,
    advertise_addr: String,
    joined: bool,
    last: Option<PeerUpdate>,
    subscribers: Vec<mpsc::UnboundedSender<PeerEvent>>,
}

impl Member {
    fn deliver(&mut self, event: &PeerEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Shared hub connecting [`MemoryTransport`]s, keyed by gossip address.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    members: Arc<Mutex<HashMap<SocketAddr, Member>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a transport for `node_id` at `gossip_addr`.
    ///
    /// A bound transport admits joiners straight away; it becomes a
    /// member itself once it joins or is joined.
    pub fn bind(
        &self,
        gossip_addr: SocketAddr,
        node_id: NodeId,
        advertise_addr: impl Into<String>,
    ) -> MemoryTransport {
        self.members.lock().insert(
            gossip_addr,
            Member {
                node_id: node_id.clone(),
                advertise_addr: advertise_addr.into(),
                joined: false,
                last: None,
                subscribers: Vec::new(),
            },
        );
        MemoryTransport {
            network: self.clone(),
            gossip_addr,
            node_id,
        }
    }

    /// Drops a member without a departure announcement, as if it crashed.
    pub fn crash(&self, gossip_addr: &SocketAddr) {
        self.members.lock().remove(gossip_addr);
    }

    /// Node IDs of current members, sorted.
    pub fn members(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .members
            .lock()
            .values()
            .filter(|m| m.joined)
            .map(|m| m.node_id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// One node's handle onto a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    gossip_addr: SocketAddr,
    node_id: NodeId,
}

impl MemoryTransport {
    pub fn gossip_addr(&self) -> SocketAddr {
        self.gossip_addr
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }
}

#[async_trait]
impl GossipTransport for MemoryTransport {
    async fn join(&self, targets: &[SocketAddr]) -> Result<usize, TransportError> {
        let mut members = self.network.members.lock();
        if !members.contains_key(&self.gossip_addr) {
            return Err(TransportError::ShutDown);
        }

        let mut admitted = 0;
        for target in targets {
            if *target == self.gossip_addr {
                continue;
            }
            if let Some(member) = members.get_mut(target) {
                member.joined = true;
                admitted += 1;
            }
        }
        if admitted == 0 {
            let list: Vec<String> = targets.iter().map(ToString::to_string).collect();
            return Err(TransportError::Unreachable(list.join(",")));
        }

        // Exchange full state with every member, as a join sync would.
        let mut existing = Vec::new();
        for (addr, member) in members.iter() {
            if *addr != self.gossip_addr && member.joined {
                existing.extend(member.last.clone());
            }
        }
        let own_last = {
            let Some(me) = members.get_mut(&self.gossip_addr) else {
                return Err(TransportError::ShutDown);
            };
            me.joined = true;
            for update in existing {
                me.deliver(&PeerEvent::Updated(update));
            }
            me.last.clone()
        };
        if let Some(update) = own_last {
            let event = PeerEvent::Updated(update);
            for (addr, member) in members.iter_mut() {
                if *addr != self.gossip_addr && member.joined {
                    member.deliver(&event);
                }
            }
        }

        Ok(admitted)
    }

    async fn leave(&self) -> Result<(), TransportError> {
        let mut members = self.network.members.lock();
        let Some(me) = members.remove(&self.gossip_addr) else {
            return Err(TransportError::ShutDown);
        };
        if me.joined {
            let event = PeerEvent::Left(self.node_id.clone());
            for member in members.values_mut().filter(|m| m.joined) {
                member.deliver(&event);
            }
        }
        Ok(())
    }

    async fn publish(&self, load: NodeLoad) -> Result<(), TransportError> {
        let mut members = self.network.members.lock();
        let update = {
            let Some(me) = members.get_mut(&self.gossip_addr) else {
                return Err(TransportError::ShutDown);
            };
            // Keep timestamps strictly increasing so receivers never drop a
            // publish made within the same millisecond.
            let timestamp_ms = match &me.last {
                Some(last) => now_ms().max(last.timestamp_ms + 1),
                None => now_ms(),
            };
            let update = PeerUpdate {
                node_id: me.node_id.clone(),
                advertise_addr: me.advertise_addr.clone(),
                load,
                timestamp_ms,
            };
            me.last = Some(update.clone());
            if !me.joined {
                // Solo node: nobody to disseminate to yet.
                return Ok(());
            }
            update
        };

        let event = PeerEvent::Updated(update);
        for (addr, member) in members.iter_mut() {
            if *addr != self.gossip_addr && member.joined {
                member.deliver(&event);
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<PeerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(me) = self.network.members.lock().get_mut(&self.gossip_addr) {
            me.subscribers.push(tx);
        }
        rx
    }
}
