//! Eventually-consistent peer table fed by gossip.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;

use super::NodeId;

/// Wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Last reported state of a single cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerState {
    pub node_id: NodeId,
    pub advertise_addr: String,
    /// Upstream connections the node reported holding.
    pub connections: usize,
    /// Timestamp (ms) of the gossip round that produced this entry.
    pub last_updated_ms: u64,
}

impl PeerState {
    /// Returns whether the entry is within `staleness` of `now_ms`.
    ///
    /// Timestamps ahead of `now_ms` (clock skew) count as fresh.
    pub fn is_fresh(&self, now_ms: u64, staleness: Duration) -> bool {
        now_ms.saturating_sub(self.last_updated_ms) <= staleness.as_millis() as u64
    }
}

/// Cluster-wide load figures derived from a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoadAverage {
    /// Mean connection count across fresh entries. Zero when undefined.
    pub avg: f64,
    /// Every entry, stale or not, including this node.
    pub node_count: usize,
    pub fresh_node_count: usize,
    /// Whether this node's own published entry is fresh.
    pub local_fresh: bool,
}

impl LoadAverage {
    /// The average only means something with at least one fresh entry.
    pub fn is_defined(&self) -> bool {
        self.fresh_node_count > 0
    }
}

/// Immutable point-in-time copy of the directory.
#[derive(Debug, Clone)]
pub struct ClusterSnapshot {
    local: Option<PeerState>,
    peers: Vec<PeerState>,
    taken_at_ms: u64,
}

impl ClusterSnapshot {
    /// This node's own published entry, if it has published yet.
    pub fn local(&self) -> Option<&PeerState> {
        self.local.as_ref()
    }

    /// Remote entries sorted by node ID.
    pub fn peers(&self) -> &[PeerState] {
        &self.peers
    }

    pub fn taken_at_ms(&self) -> u64 {
        self.taken_at_ms
    }

    /// Computes the cluster average over entries fresher than `staleness`.
    pub fn average(&self, staleness: Duration) -> LoadAverage {
        let now = self.taken_at_ms;
        let local_fresh = self
            .local
            .as_ref()
            .map(|l| l.is_fresh(now, staleness))
            .unwrap_or(false);

        let mut node_count = 0;
        let mut fresh_node_count = 0;
        let mut total = 0usize;
        for entry in self.local.iter().chain(self.peers.iter()) {
            node_count += 1;
            if entry.is_fresh(now, staleness) {
                fresh_node_count += 1;
                total += entry.connections;
            } else {
                tracing::trace!(
                    node_id = %entry.node_id,
                    age_ms = now.saturating_sub(entry.last_updated_ms),
                    "excluding stale entry from average"
                );
            }
        }

        let avg = if fresh_node_count == 0 {
            0.0
        } else {
            total as f64 / fresh_node_count as f64
        };

        LoadAverage {
            avg,
            node_count,
            fresh_node_count,
            local_fresh,
        }
    }
}

/// Thread-safe table of every known cluster member, including this node.
///
/// Gossip ingestion calls [`update`](Self::update) at high frequency, so
/// writes only lock the shard holding that peer. Readers copy entries out
/// one at a time; each copied entry is whole, never half-written.
pub struct ClusterDirectory {
    local_id: NodeId,
    local_addr: String,
    entries: DashMap<NodeId, PeerState>,
    /// Last timestamp seen from each removed peer. Updates at or before it
    /// are late gossip and must not resurrect the entry.
    departed: DashMap<NodeId, u64>,
    staleness: Duration,
    version: AtomicU64,
}

impl ClusterDirectory {
    /// Creates an empty directory for the node `local_id`.
    pub fn new(local_id: NodeId, local_addr: impl Into<String>, staleness: Duration) -> Self {
        Self {
            local_id,
            local_addr: local_addr.into(),
            entries: DashMap::new(),
            departed: DashMap::new(),
            staleness,
            version: AtomicU64::new(0),
        }
    }

    /// Applies a gossip update for a remote peer.
    ///
    /// Last writer wins by `timestamp_ms`; an update no newer than the
    /// stored entry, or than the last state of a removed peer, is dropped.
    /// Updates naming this node are ignored since only
    /// [`update_local`](Self::update_local) may write our own entry.
    /// Returns whether the update was applied.
    pub fn update(
        &self,
        node_id: NodeId,
        advertise_addr: impl Into<String>,
        connections: usize,
        timestamp_ms: u64,
    ) -> bool {
        if node_id == self.local_id {
            return false;
        }
        let departed_at = self.departed.get(&node_id).map(|ts| *ts);
        if departed_at.is_some_and(|ts| timestamp_ms <= ts) {
            tracing::trace!(node_id = %node_id, timestamp_ms, "dropping update from departed peer");
            return false;
        }
        let incoming = PeerState {
            node_id: node_id.clone(),
            advertise_addr: advertise_addr.into(),
            connections,
            last_updated_ms: timestamp_ms,
        };
        let applied = self.merge(incoming);
        if applied && departed_at.is_some() {
            self.departed.remove(&node_id);
        }
        applied
    }

    /// Records the count this node just published to the cluster.
    pub fn update_local(&self, connections: usize, timestamp_ms: u64) -> bool {
        let incoming = PeerState {
            node_id: self.local_id.clone(),
            advertise_addr: self.local_addr.clone(),
            connections,
            last_updated_ms: timestamp_ms,
        };
        self.merge(incoming)
    }

    fn merge(&self, incoming: PeerState) -> bool {
        let applied = match self.entries.entry(incoming.node_id.clone()) {
            Entry::Occupied(mut existing) => {
                if incoming.last_updated_ms > existing.get().last_updated_ms {
                    existing.insert(incoming);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(incoming);
                true
            }
        };
        if applied {
            self.version.fetch_add(1, Ordering::Relaxed);
        }
        applied
    }

    /// Removes a peer that has confirmed departure.
    pub fn remove(&self, node_id: &NodeId) -> Option<PeerState> {
        if *node_id == self.local_id {
            return None;
        }
        let removed = self.entries.remove(node_id).map(|(_, state)| state);
        if let Some(state) = &removed {
            self.departed.insert(node_id.clone(), state.last_updated_ms);
            self.version.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Takes a snapshot stamped with the current time.
    pub fn snapshot(&self) -> ClusterSnapshot {
        self.snapshot_at(now_ms())
    }

    /// Takes a snapshot stamped with `now_ms`, against which staleness is
    /// later judged.
    pub fn snapshot_at(&self, now_ms: u64) -> ClusterSnapshot {
        let mut local = None;
        let mut peers = Vec::with_capacity(self.entries.len());
        for entry in self.entries.iter() {
            if *entry.key() == self.local_id {
                local = Some(entry.value().clone());
            } else {
                peers.push(entry.value().clone());
            }
        }
        peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));

        ClusterSnapshot {
            local,
            peers,
            taken_at_ms: now_ms,
        }
    }

    /// Average over fresh entries as of now.
    pub fn average(&self) -> LoadAverage {
        self.snapshot().average(self.staleness)
    }

    /// Average over fresh entries as of `now_ms`.
    pub fn average_at(&self, now_ms: u64) -> LoadAverage {
        self.snapshot_at(now_ms).average(self.staleness)
    }

    /// Returns a single remote or local entry.
    pub fn get(&self, node_id: &NodeId) -> Option<PeerState> {
        self.entries.get(node_id).map(|entry| entry.value().clone())
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    /// Number of applied updates and removals so far.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }

    /// Number of known remote peers, stale or not.
    pub fn peer_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| *entry.key() != self.local_id)
            .count()
    }
}
