//! Node lifecycle: join, background loops and graceful shutdown.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{
    now_ms, ClusterDirectory, GossipTransport, JoinCoordinator, JoinError, JoinOutcome, JoinState,
    LoadAverage, NodeId, NodeLoad, PeerEvent,
};
use crate::config::{Config, ConfigError};
use crate::rebalance::{Rebalancer, RebalancerState, RebalancerStats};
use crate::upstream::ConnectionRegistry;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Join(#[from] JoinError),

    #[error("node already started")]
    AlreadyStarted,
}

/// One directory entry as reported on the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MemberStatus {
    pub node_id: NodeId,
    pub advertise_addr: String,
    pub connections: usize,
    pub last_updated_ms: u64,
    pub fresh: bool,
    pub local: bool,
}

/// Point-in-time view of the node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub join_state: JoinState,
    pub ready: bool,
    pub shutting_down: bool,
    pub local_connections: usize,
    pub tenants: BTreeMap<String, usize>,
    pub average: LoadAverage,
    pub rebalancer_state: RebalancerState,
    pub rebalancer: RebalancerStats,
    /// Every known member, stale ones included.
    pub members: Vec<MemberStatus>,
}

/// A cluster member: owns the directory, the connection registry and the
/// rebalancer, and drives them from the gossip transport.
pub struct Node {
    config: Config,
    node_id: NodeId,
    transport: Arc<dyn GossipTransport>,
    directory: Arc<ClusterDirectory>,
    registry: Arc<ConnectionRegistry>,
    rebalancer: Arc<Rebalancer>,
    join_state: Mutex<JoinState>,
    started: AtomicBool,
    ready: AtomicBool,
    shutting_down: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Builds a node from a config that has not necessarily been validated.
    ///
    /// `transport` must already be bound under `node_id`.
    pub fn new(
        config: Config,
        node_id: NodeId,
        transport: Arc<dyn GossipTransport>,
    ) -> Result<Self, NodeError> {
        config.validate()?;

        let directory = Arc::new(ClusterDirectory::new(
            node_id.clone(),
            config.advertise_addr(),
            config.staleness(),
        ));
        let registry = Arc::new(ConnectionRegistry::new(config.max_connections()));
        let rebalancer = Arc::new(Rebalancer::new(
            config.rebalance(),
            Arc::clone(&directory),
            Arc::clone(&registry),
        ));

        Ok(Self {
            config,
            node_id,
            transport,
            directory,
            registry,
            rebalancer,
            join_state: Mutex::new(JoinState::Bootstrapping),
            started: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Joins the cluster, then starts gossip ingestion, load publishing
    /// and the rebalancer.
    ///
    /// Fails only when the join aborts, in which case nothing is left
    /// running and the process should exit.
    pub async fn start(&self) -> Result<JoinOutcome, NodeError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(NodeError::AlreadyStarted);
        }
        info!(node_id = %self.node_id, advertise_addr = %self.config.advertise_addr(), "starting node");

        // Subscribe before joining so the join state sync is not missed.
        let events = self.transport.subscribe();
        self.spawn(ingest_loop(
            events,
            Arc::clone(&self.directory),
            self.cancel.child_token(),
        ));

        *self.join_state.lock() = JoinState::Joining;
        let mut coordinator =
            JoinCoordinator::new(Arc::clone(&self.transport), self.config.join_attempt());
        let outcome = coordinator.run().await;
        *self.join_state.lock() = coordinator.state();

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                self.cancel.cancel();
                self.join_tasks().await;
                return Err(e.into());
            }
        };

        self.spawn(publish_loop(
            Arc::clone(&self.transport),
            Arc::clone(&self.directory),
            Arc::clone(&self.registry),
            self.config.gossip_interval(),
            self.cancel.child_token(),
        ));
        self.spawn(Arc::clone(&self.rebalancer).run(self.cancel.child_token()));

        self.ready.store(true, Ordering::Release);
        info!(node_id = %self.node_id, outcome = ?outcome, "node ready");
        Ok(outcome)
    }

    /// Leaves the cluster and drains local connections within the grace
    /// period. Returns how many connections were drained.
    ///
    /// Shedding stops before anything else so no new victims are picked
    /// while draining. Calling this twice is a no-op.
    pub async fn shutdown(&self) -> usize {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return 0;
        }
        self.ready.store(false, Ordering::Release);
        self.cancel.cancel();

        let grace = self.config.grace_period();
        // An unrepresentable deadline means no deadline at all.
        let deadline = Instant::now().checked_add(grace);
        info!(node_id = %self.node_id, grace = ?grace, "shutting down node");

        match tokio::time::timeout(grace, self.transport.leave()).await {
            Ok(Ok(())) => debug!("left cluster"),
            Ok(Err(e)) => warn!(error = %e, "failed to leave cluster"),
            Err(_) => warn!("leaving cluster timed out"),
        }

        let remaining = match deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => grace,
        };
        let drained = match tokio::time::timeout(remaining, self.registry.drain()).await {
            Ok(drained) => drained,
            Err(_) => {
                warn!(
                    remaining = self.registry.local_count(),
                    "grace period expired before all connections drained"
                );
                0
            }
        };

        self.join_tasks().await;
        info!(drained, "node stopped");
        drained
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().push(tokio::spawn(task));
    }

    async fn join_tasks(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "node task failed");
            }
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn directory(&self) -> &Arc<ClusterDirectory> {
        &self.directory
    }

    /// Registry the proxy servers register upstream connections with.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn rebalancer(&self) -> &Arc<Rebalancer> {
        &self.rebalancer
    }

    pub fn join_state(&self) -> JoinState {
        *self.join_state.lock()
    }

    /// Joined and not shutting down.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn status(&self) -> NodeStatus {
        let snapshot = self.directory.snapshot();
        let staleness = self.directory.staleness();
        let now = snapshot.taken_at_ms();

        let members = snapshot
            .local()
            .into_iter()
            .chain(snapshot.peers().iter())
            .map(|entry| MemberStatus {
                node_id: entry.node_id.clone(),
                advertise_addr: entry.advertise_addr.clone(),
                connections: entry.connections,
                last_updated_ms: entry.last_updated_ms,
                fresh: entry.is_fresh(now, staleness),
                local: entry.node_id == self.node_id,
            })
            .collect();

        NodeStatus {
            node_id: self.node_id.clone(),
            join_state: self.join_state(),
            ready: self.is_ready(),
            shutting_down: self.is_shutting_down(),
            local_connections: self.registry.local_count(),
            tenants: self.registry.tenant_counts().into_iter().collect(),
            average: snapshot.average(staleness),
            rebalancer_state: self.rebalancer.state(),
            rebalancer: self.rebalancer.stats(),
            members,
        }
    }
}

/// Applies peer events to the directory until cancelled or the transport
/// closes the stream.
async fn ingest_loop(
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
    directory: Arc<ClusterDirectory>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Some(PeerEvent::Updated(update)) => {
                if update.node_id == *directory.local_id() {
                    continue;
                }
                let node_id = update.node_id.clone();
                let applied = directory.update(
                    update.node_id,
                    update.advertise_addr,
                    update.load.connections,
                    update.timestamp_ms,
                );
                if !applied {
                    debug!(node_id = %node_id, "dropped out-of-order peer update");
                }
            }
            Some(PeerEvent::Left(node_id)) => {
                if directory.remove(&node_id).is_some() {
                    info!(node_id = %node_id, "peer left cluster");
                }
            }
            None => {
                debug!("peer event stream closed");
                break;
            }
        }
    }
}

/// Publishes the local connection count every gossip interval and records
/// it as this node's own directory entry.
async fn publish_loop(
    transport: Arc<dyn GossipTransport>,
    directory: Arc<ClusterDirectory>,
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_published_ms = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let connections = registry.local_count();
        match transport.publish(NodeLoad { connections }).await {
            Ok(()) => {
                last_published_ms = now_ms().max(last_published_ms + 1);
                directory.update_local(connections, last_published_ms);
            }
            Err(e) => warn!(error = %e, "failed to publish local load"),
        }
    }
}
