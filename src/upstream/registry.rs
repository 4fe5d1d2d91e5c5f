//! Live upstream connections on this node, grouped by tenant.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::victims;

/// Registry-assigned identifier of a connection.
pub type ConnectionId = u64;

/// Handle onto an upstream connection owned by the proxy servers.
#[async_trait]
pub trait UpstreamConn: Send + Sync + 'static {
    /// Closes the connection. Must be idempotent.
    async fn close(&self) -> io::Result<()>;
}

/// Errors returned by [`ConnectionRegistry`].
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("node connection limit of {limit} reached")]
    CapacityExceeded { limit: usize },
}

/// A connection chosen for shedding.
#[derive(Clone)]
pub struct Victim {
    pub tenant_id: String,
    pub id: ConnectionId,
    conn: Arc<dyn UpstreamConn>,
}

impl fmt::Debug for Victim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Victim")
            .field("tenant_id", &self.tenant_id)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Tracks upstream connections per tenant.
///
/// Thread-safe via DashMap; the total is kept in an atomic so
/// [`local_count`](Self::local_count) never takes a lock. Removal from the
/// registry is the single authoritative event for a connection, so a
/// connection is never counted twice or shed twice.
pub struct ConnectionRegistry {
    tenants: DashMap<String, HashMap<ConnectionId, Arc<dyn UpstreamConn>>>,
    total: AtomicUsize,
    next_id: AtomicU64,
    max_connections: Option<usize>,
}

impl ConnectionRegistry {
    /// Creates a registry. `max_connections` of `None` means unlimited.
    pub fn new(max_connections: Option<usize>) -> Self {
        Self {
            tenants: DashMap::new(),
            total: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            max_connections,
        }
    }

    /// Adds a connection to the tenant's set.
    ///
    /// Fails with [`RegistryError::CapacityExceeded`] when the node
    /// already holds `max_connections`.
    pub fn register(
        &self,
        tenant_id: &str,
        conn: Arc<dyn UpstreamConn>,
    ) -> Result<ConnectionId, RegistryError> {
        if let Some(limit) = self.max_connections {
            self.total
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < limit).then_some(n + 1)
                })
                .map_err(|_| RegistryError::CapacityExceeded { limit })?;
        } else {
            self.total.fetch_add(1, Ordering::AcqRel);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tenants
            .entry(tenant_id.to_string())
            .or_default()
            .insert(id, conn);

        tracing::debug!(tenant_id, conn_id = id, "upstream registered");
        Ok(id)
    }

    /// Removes a connection. Returns `false` if it was already gone.
    pub fn unregister(&self, tenant_id: &str, id: ConnectionId) -> bool {
        let removed = match self.tenants.get_mut(tenant_id) {
            Some(mut set) => set.remove(&id).is_some(),
            None => false,
        };
        if removed {
            self.total.fetch_sub(1, Ordering::AcqRel);
            self.tenants.remove_if(tenant_id, |_, set| set.is_empty());
            tracing::debug!(tenant_id, conn_id = id, "upstream unregistered");
        }
        removed
    }

    /// Connections currently registered on this node.
    pub fn local_count(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    /// Connections registered for one tenant.
    pub fn tenant_count(&self, tenant_id: &str) -> usize {
        self.tenants.get(tenant_id).map(|set| set.len()).unwrap_or(0)
    }

    /// Per-tenant connection counts, sorted by tenant ID.
    pub fn tenant_counts(&self) -> Vec<(String, usize)> {
        let mut counts: Vec<(String, usize)> = self
            .tenants
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().len()))
            .collect();
        counts.sort();
        counts
    }

    pub fn is_registered(&self, tenant_id: &str, id: ConnectionId) -> bool {
        self.tenants
            .get(tenant_id)
            .map(|set| set.contains_key(&id))
            .unwrap_or(false)
    }

    pub fn max_connections(&self) -> Option<usize> {
        self.max_connections
    }

    /// Chooses up to `n` connections to shed.
    ///
    /// Tenants contribute in proportion to their share of this node's
    /// connections; within a tenant the choice is random.
    pub fn select_victims(&self, n: usize) -> Vec<Victim> {
        if n == 0 {
            return Vec::new();
        }

        let mut view: Vec<(String, Vec<(ConnectionId, Arc<dyn UpstreamConn>)>)> = self
            .tenants
            .iter()
            .map(|entry| {
                let conns = entry
                    .value()
                    .iter()
                    .map(|(id, conn)| (*id, Arc::clone(conn)))
                    .collect();
                (entry.key().clone(), conns)
            })
            .collect();
        view.sort_by(|a, b| a.0.cmp(&b.0));

        let counts: Vec<usize> = view.iter().map(|(_, conns)| conns.len()).collect();
        let shares = victims::allocate(&counts, n);

        let mut rng = rand::thread_rng();
        let mut selected = Vec::with_capacity(shares.iter().sum());
        for ((tenant_id, conns), share) in view.into_iter().zip(shares) {
            if share == 0 {
                continue;
            }
            for (id, conn) in victims::sample(&conns, share, &mut rng) {
                selected.push(Victim {
                    tenant_id: tenant_id.clone(),
                    id,
                    conn,
                });
            }
        }
        selected
    }

    /// Sheds a victim: removes it from the registry, then closes it.
    ///
    /// The registry entry goes regardless of whether the close succeeds.
    /// A victim unregistered since selection is left alone. Returns whether
    /// this call removed it.
    ///
    /// The close runs on its own task, so once the entry is gone the close
    /// completes even if the caller is dropped.
    pub async fn close(&self, victim: &Victim) -> bool {
        if !self.unregister(&victim.tenant_id, victim.id) {
            return false;
        }
        let conn = Arc::clone(&victim.conn);
        let tenant_id = victim.tenant_id.clone();
        let conn_id = victim.id;
        let closing = tokio::spawn(async move {
            if let Err(e) = conn.close().await {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    conn_id,
                    error = %e,
                    "failed to close shed upstream"
                );
            }
        });
        if let Err(e) = closing.await {
            tracing::warn!(conn_id = victim.id, error = %e, "shed close task failed");
        }
        true
    }

    /// Closes every registered connection. Returns how many were closed.
    pub async fn drain(&self) -> usize {
        let victims = self.select_victims(self.local_count());
        let mut closed = 0;
        for victim in &victims {
            if self.close(victim).await {
                closed += 1;
            }
        }
        closed
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;

    /// Connection double counting close calls.
    #[derive(Default)]
    pub(crate) struct TestConn {
        pub closes: AtomicUsize,
        pub fail: AtomicBool,
    }

    #[async_trait]
    impl UpstreamConn for TestConn {
        async fn close(&self) -> io::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
            }
            Ok(())
        }
    }

    /// Connection whose close takes 200ms, counting starts and completions.
    #[derive(Default)]
    pub(crate) struct SlowConn {
        pub started: AtomicUsize,
        pub finished: AtomicUsize,
    }

    #[async_trait]
    impl UpstreamConn for SlowConn {
        async fn close(&self) -> io::Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub(crate) fn fill(registry: &ConnectionRegistry, tenant: &str, n: usize) -> Vec<ConnectionId> {
        (0..n)
            .map(|_| registry.register(tenant, Arc::new(TestConn::default())).unwrap())
            .collect()
    }

    // ========== Register / Unregister ==========

    #[test]
    fn test_new_registry_empty() {
        let registry = ConnectionRegistry::default();
        assert_eq!(registry.local_count(), 0);
        assert!(registry.tenant_counts().is_empty());
        assert_eq!(registry.max_connections(), None);
    }

    #[test]
    fn test_register_counts_per_tenant_and_total() {
        let registry = ConnectionRegistry::default();
        fill(&registry, "a", 3);
        fill(&registry, "b", 2);

        assert_eq!(registry.local_count(), 5);
        assert_eq!(registry.tenant_count("a"), 3);
        assert_eq!(registry.tenant_count("b"), 2);
        assert_eq!(
            registry.tenant_counts(),
            vec![("a".to_string(), 3), ("b".to_string(), 2)]
        );
    }

    #[test]
    fn test_register_assigns_unique_ids() {
        let registry = ConnectionRegistry::default();
        let mut ids = fill(&registry, "a", 10);
        ids.extend(fill(&registry, "b", 10));
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), 20);
    }

    #[test]
    fn test_register_capacity_exceeded() {
        let registry = ConnectionRegistry::new(Some(2));
        fill(&registry, "a", 2);

        let err = registry
            .register("b", Arc::new(TestConn::default()))
            .unwrap_err();
        assert!(matches!(err, RegistryError::CapacityExceeded { limit: 2 }));
        assert_eq!(registry.local_count(), 2);
        assert_eq!(registry.tenant_count("b"), 0);
    }

    #[test]
    fn test_capacity_frees_after_unregister() {
        let registry = ConnectionRegistry::new(Some(1));
        let ids = fill(&registry, "a", 1);
        registry.unregister("a", ids[0]);
        assert!(registry.register("a", Arc::new(TestConn::default())).is_ok());
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = ConnectionRegistry::default();
        let ids = fill(&registry, "a", 2);

        assert!(registry.unregister("a", ids[0]));
        let after_once = (registry.local_count(), registry.tenant_counts());
        assert!(!registry.unregister("a", ids[0]));
        assert_eq!((registry.local_count(), registry.tenant_counts()), after_once);
    }

    #[test]
    fn test_unregister_wrong_tenant_is_noop() {
        let registry = ConnectionRegistry::default();
        let ids = fill(&registry, "a", 1);
        assert!(!registry.unregister("b", ids[0]));
        assert_eq!(registry.local_count(), 1);
    }

    #[test]
    fn test_unregister_last_connection_drops_tenant() {
        let registry = ConnectionRegistry::default();
        let ids = fill(&registry, "a", 1);
        registry.unregister("a", ids[0]);
        assert!(registry.tenant_counts().is_empty());
    }

    // ========== Victim selection ==========

    #[test]
    fn test_select_victims_bounded_registered_distinct() {
        let registry = ConnectionRegistry::default();
        fill(&registry, "a", 7);
        fill(&registry, "b", 3);

        for n in [0, 1, 4, 10, 25] {
            let victims = registry.select_victims(n);
            assert!(victims.len() <= n);
            assert_eq!(victims.len(), n.min(10));
            let unique: HashSet<_> = victims.iter().map(|v| v.id).collect();
            assert_eq!(unique.len(), victims.len());
            assert!(victims.iter().all(|v| registry.is_registered(&v.tenant_id, v.id)));
        }
    }

    #[test]
    fn test_select_victims_proportional() {
        let registry = ConnectionRegistry::default();
        fill(&registry, "a", 80);
        fill(&registry, "b", 20);

        let victims = registry.select_victims(10);
        let from_a = victims.iter().filter(|v| v.tenant_id == "a").count();
        let from_b = victims.iter().filter(|v| v.tenant_id == "b").count();
        assert_eq!((from_a, from_b), (8, 2));
    }

    #[test]
    fn test_select_victims_does_not_remove() {
        let registry = ConnectionRegistry::default();
        fill(&registry, "a", 5);
        registry.select_victims(3);
        assert_eq!(registry.local_count(), 5);
    }

    // ========== Close ==========

    #[tokio::test]
    async fn test_close_removes_and_closes() {
        let registry = ConnectionRegistry::default();
        let conn = Arc::new(TestConn::default());
        let id = registry.register("a", conn.clone()).unwrap();

        let victims = registry.select_victims(1);
        assert_eq!(victims[0].id, id);
        assert!(registry.close(&victims[0]).await);

        assert_eq!(registry.local_count(), 0);
        assert_eq!(conn.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_after_unregister_is_noop() {
        let registry = ConnectionRegistry::default();
        let conn = Arc::new(TestConn::default());
        let id = registry.register("a", conn.clone()).unwrap();

        let victims = registry.select_victims(1);
        registry.unregister("a", id);

        assert!(!registry.close(&victims[0]).await);
        assert_eq!(conn.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_twice_sheds_once() {
        let registry = ConnectionRegistry::default();
        let conn = Arc::new(TestConn::default());
        registry.register("a", conn.clone()).unwrap();

        let victims = registry.select_victims(1);
        assert!(registry.close(&victims[0]).await);
        assert!(!registry.close(&victims[0]).await);
        assert_eq!(conn.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_error_still_removes() {
        let registry = ConnectionRegistry::default();
        let conn = Arc::new(TestConn::default());
        conn.fail.store(true, Ordering::SeqCst);
        registry.register("a", conn.clone()).unwrap();

        let victims = registry.select_victims(1);
        assert!(registry.close(&victims[0]).await);
        assert_eq!(registry.local_count(), 0);
        assert_eq!(conn.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drain_closes_everything() {
        let registry = ConnectionRegistry::default();
        fill(&registry, "a", 4);
        fill(&registry, "b", 3);

        assert_eq!(registry.drain().await, 7);
        assert_eq!(registry.local_count(), 0);
        assert!(registry.tenant_counts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_completes_when_caller_dropped() {
        let registry = ConnectionRegistry::default();
        let conn = Arc::new(SlowConn::default());
        registry.register("a", Arc::clone(&conn) as _).unwrap();
        let victims = registry.select_victims(1);

        // Caller gives up while the close is still running.
        let gave_up = tokio::time::timeout(
            std::time::Duration::from_millis(10),
            registry.close(&victims[0]),
        )
        .await;
        assert!(gave_up.is_err());
        assert_eq!(registry.local_count(), 0);

        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        assert_eq!(conn.started.load(Ordering::SeqCst), 1);
        assert_eq!(conn.finished.load(Ordering::SeqCst), 1);
    }

    // ========== Thread Safety ==========

    #[test]
    fn test_concurrent_register_unregister() {
        use std::thread;

        let registry = Arc::new(ConnectionRegistry::default());
        let mut handles = vec![];

        for i in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                let tenant = format!("tenant-{}", i % 3);
                for _ in 0..100 {
                    let id = registry
                        .register(&tenant, Arc::new(TestConn::default()))
                        .unwrap();
                    if id % 2 == 0 {
                        assert!(registry.unregister(&tenant, id));
                    }
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let summed: usize = registry.tenant_counts().iter().map(|(_, n)| n).sum();
        assert_eq!(registry.local_count(), summed);
        assert_eq!(summed, 400);
    }

    #[test]
    fn test_concurrent_capacity_never_exceeded() {
        use std::thread;

        let registry = Arc::new(ConnectionRegistry::new(Some(50)));
        let mut handles = vec![];
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                for _ in 0..20 {
                    let _ = registry.register("a", Arc::new(TestConn::default()));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.local_count(), 50);
        assert_eq!(registry.tenant_count("a"), 50);
    }

    #[test]
    fn test_registry_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ConnectionRegistry>();
        assert_send_sync::<Victim>();
    }
}
