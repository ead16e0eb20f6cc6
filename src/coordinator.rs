//! Coordinator facade.
//!
//! Wires the registry, health monitor, router, replication coordinator and
//! failover controller around one topology channel and owns their background
//! loops.

use crate::config::CoordinatorConfig;
use crate::core::{RequestContext, Result};
use crate::monitoring::events::EventSink;
use crate::monitoring::metrics::{CoordinatorMetrics, MetricsSnapshot};
use crate::region::failover::FailoverController;
use crate::region::health::HealthMonitor;
use crate::region::registry::RegionRegistry;
use crate::region::replication::ReplicationCoordinator;
use crate::region::router::{ConsistencyLevel, ConsistencyRouter, RouteTarget};
use crate::region::status::StatusReport;
use crate::region::store::RegionStore;
use crate::region::topology::TopologySnapshot;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Result of a routed write.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteReceipt {
    /// Region that applied the write
    pub route: RouteTarget,
    /// Replication task fanning it out
    pub task_id: String,
}

/// Multi-region coordinator.
pub struct RegionCoordinator {
    config: CoordinatorConfig,
    registry: Arc<RegionRegistry>,
    monitor: Arc<HealthMonitor>,
    router: ConsistencyRouter,
    replication: ReplicationCoordinator,
    failover: Arc<FailoverController>,
    metrics: Arc<CoordinatorMetrics>,
    shutdown: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl RegionCoordinator {
    /// Build a coordinator. Fails with a configuration error on an invalid topology.
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn RegionStore>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let metrics = Arc::new(CoordinatorMetrics::new());
        let registry = Arc::new(RegionRegistry::new(&config, events.clone(), metrics.clone())?);

        let monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            store.clone(),
            config.health.clone(),
            metrics.clone(),
        ));
        let router = ConsistencyRouter::new(registry.subscribe());
        let replication = ReplicationCoordinator::new(
            registry.subscribe(),
            store.clone(),
            config.replication.clone(),
            events.clone(),
            metrics.clone(),
        );
        let failover = Arc::new(FailoverController::new(
            registry.clone(),
            store,
            Arc::new(replication.clone()),
            config.failover.clone(),
            events,
            metrics.clone(),
        ));
        let (shutdown, _) = broadcast::channel(1);

        info!(regions = config.regions.len(), "region coordinator created");

        Ok(Self {
            config,
            registry,
            monitor,
            router,
            replication,
            failover,
            metrics,
            shutdown,
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Start probe loops, the failover watcher and replication GC.
    ///
    /// Calling it again while running has no effect.
    pub fn start(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        if !handles.is_empty() {
            return;
        }

        handles.extend(self.monitor.spawn(&self.shutdown));
        handles.push(self.failover.spawn(self.shutdown.subscribe()));
        handles.push(self.replication.spawn_gc(self.shutdown.subscribe()));
        info!(tasks = handles.len(), "region coordinator started");
    }

    /// Stop all background loops and wait for them.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if handles.is_empty() {
            return;
        }

        let _ = self.shutdown.send(());
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!("region coordinator stopped");
    }

    /// Route a read.
    pub fn route_read(&self, ctx: &RequestContext, level: ConsistencyLevel) -> Result<RouteTarget> {
        self.router.route_read(ctx, level)
    }

    /// Route a write.
    pub fn route_write(&self, ctx: &RequestContext, level: ConsistencyLevel) -> Result<RouteTarget> {
        self.router.route_write(ctx, level)
    }

    /// Fan out a write already applied at the primary.
    pub fn submit_replication(&self, key: &str, payload: Vec<u8>) -> Result<String> {
        self.replication.submit_replication(key, payload)
    }

    /// Route a write, apply it at the routed region and fan it out.
    pub async fn write(
        &self,
        ctx: &RequestContext,
        level: ConsistencyLevel,
        key: &str,
        payload: Vec<u8>,
    ) -> Result<WriteReceipt> {
        let route = self.route_write(ctx, level)?;
        let task_id = self
            .replication
            .apply_and_replicate(&route.region_id, key, payload)
            .await?;
        Ok(WriteReceipt { route, task_id })
    }

    /// Status of every region plus the cluster verdict.
    pub fn status_report(&self) -> StatusReport {
        StatusReport::from_snapshot(&self.topology(), self.config.health.min_reachable_regions)
    }

    /// Whether the caller's region is the current primary.
    pub fn is_primary(&self, ctx: &RequestContext) -> bool {
        self.topology()
            .primary()
            .map(|r| ctx.is_in(&r.id))
            .unwrap_or(false)
    }

    /// Current topology snapshot.
    pub fn topology(&self) -> Arc<TopologySnapshot> {
        self.registry.list_regions()
    }

    /// Subscribe to topology changes.
    pub fn subscribe(&self) -> watch::Receiver<Arc<TopologySnapshot>> {
        self.registry.subscribe()
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RegionRegistry> {
        &self.registry
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn replication(&self) -> &ReplicationCoordinator {
        &self.replication
    }

    pub fn failover(&self) -> &Arc<FailoverController> {
        &self.failover
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegionConfig;
    use crate::core::Error;
    use crate::monitoring::events::RecordingSink;
    use crate::region::replication::{DeliveryStatus, ReplicationOutcome};
    use crate::region::store::MemoryStore;
    use crate::region::topology::RegionRole;
    use std::time::Duration;

    fn config() -> CoordinatorConfig {
        CoordinatorConfig::new(vec![
            RegionConfig::new("A", "https://a.internal").as_primary(),
            RegionConfig::new("B", "https://b.internal"),
            RegionConfig::new("C", "https://c.internal"),
        ])
    }

    fn coordinator() -> (RegionCoordinator, Arc<MemoryStore>, Arc<RecordingSink>) {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::new());
        let coordinator = RegionCoordinator::new(config(), store.clone(), sink.clone()).unwrap();
        (coordinator, store, sink)
    }

    #[test]
    fn test_rejects_invalid_topology() {
        let mut config = config();
        config.regions[1].role = RegionRole::Primary;
        let result = RegionCoordinator::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(RecordingSink::new()),
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_failure_promotes_least_lagging_standby() {
        let (coordinator, store, sink) = coordinator();
        coordinator.start();

        store.fail_applies("C", 100);
        let ctx = RequestContext::from_region("A");
        let receipt = coordinator
            .write(&ctx, ConsistencyLevel::Strong, "order:1", b"placed".to_vec())
            .await
            .unwrap();
        assert_eq!(receipt.route.region_id, "A");
        assert!(receipt.route.colocated);

        store.set_reachable("A", false);
        tokio::time::sleep(Duration::from_secs(100)).await;

        let topology = coordinator.topology();
        assert_eq!(topology.get("A").unwrap().role, RegionRole::Unreachable);
        assert_eq!(topology.primary().unwrap().id, "B");

        let route = coordinator
            .route_write(&RequestContext::anonymous(), ConsistencyLevel::Strong)
            .unwrap();
        assert_eq!(route.region_id, "B");
        assert_eq!(route.endpoint, "https://b.internal");

        let task = coordinator.replication().task(&receipt.task_id).unwrap();
        assert_eq!(task.target("B").unwrap().status, DeliveryStatus::Acked);
        assert_eq!(task.target("C").unwrap().status, DeliveryStatus::Failed);
        assert_eq!(task.outcome(), ReplicationOutcome::PartiallyReplicated);

        assert_eq!(sink.count("promotion_completed"), 1);
        assert_eq!(coordinator.failover().history()[0].failed_region.as_deref(), Some("A"));
        assert!(coordinator.is_primary(&RequestContext::from_region("B")));

        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_primary_returns_as_standby() {
        let (coordinator, store, _) = coordinator();
        coordinator.start();

        store.set_reachable("A", false);
        tokio::time::sleep(Duration::from_secs(100)).await;
        store.set_reachable("A", true);
        tokio::time::sleep(Duration::from_secs(31)).await;

        let topology = coordinator.topology();
        assert_eq!(topology.get("A").unwrap().role, RegionRole::Standby);
        assert!(topology.get("A").unwrap().healthy);
        assert_ne!(topology.primary().unwrap().id, "A");
        assert_eq!(coordinator.failover().history().len(), 1);

        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_regions_down_is_degraded() {
        let (coordinator, store, sink) = coordinator();
        coordinator.start();

        store.set_reachable("B", false);
        store.set_reachable("C", false);
        tokio::time::sleep(Duration::from_secs(70)).await;
        store.set_reachable("A", false);
        tokio::time::sleep(Duration::from_secs(100)).await;

        let ctx = RequestContext::anonymous();
        for level in [ConsistencyLevel::Eventual, ConsistencyLevel::Strong] {
            assert!(matches!(coordinator.route_read(&ctx, level), Err(Error::NoHealthyRegion)));
            assert!(matches!(coordinator.route_write(&ctx, level), Err(Error::NoHealthyRegion)));
        }

        assert!(coordinator.failover().history().is_empty());
        assert_eq!(sink.count("promotion_aborted"), 0);
        assert_eq!(sink.count("failover_suppressed"), 1);

        let report = coordinator.status_report();
        assert!(!report.cluster.healthy);
        assert_eq!(report.cluster.reachable, 0);
        assert!(report.regions.iter().all(|r| r.last_error.is_some()));

        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_promotion_keeps_newest_value_everywhere() {
        let (coordinator, store, _) = coordinator();
        let ctx = RequestContext::anonymous();
        store.fail_applies("B", 1);

        let w1 = coordinator
            .write(&ctx, ConsistencyLevel::Strong, "k", b"W1".to_vec())
            .await
            .unwrap();
        assert_eq!(w1.route.region_id, "A");
        tokio::time::sleep(Duration::from_millis(100)).await;

        coordinator.failover().manual_promote("B", "operator").await.unwrap();
        let w2 = coordinator
            .write(&ctx, ConsistencyLevel::Strong, "k", b"W2".to_vec())
            .await
            .unwrap();
        assert_eq!(w2.route.region_id, "B");

        coordinator.replication().wait_for(&w1.task_id).await.unwrap();
        coordinator.replication().wait_for(&w2.task_id).await.unwrap();

        for region in ["A", "B", "C"] {
            assert_eq!(store.get(region, "k"), Some(b"W2".to_vec()));
        }
        assert_eq!(store.applied_sequences("B", "k"), vec![2]);
        assert_eq!(store.applied_sequences("A", "k"), vec![1, 2]);
        assert_eq!(store.applied_sequences("C", "k"), vec![1, 2]);

        let read = coordinator.route_read(&ctx, ConsistencyLevel::Strong).unwrap();
        assert_eq!(read.region_id, "B");
        assert_eq!(store.get(&read.region_id, "k"), Some(b"W2".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_automatic_failover_keeps_newest_value_everywhere() {
        let (coordinator, store, _) = coordinator();
        let ctx = RequestContext::anonymous();
        coordinator.start();
        store.fail_applies("B", 1);

        let w1 = coordinator
            .write(&ctx, ConsistencyLevel::Strong, "k", b"W1".to_vec())
            .await
            .unwrap();
        store.set_reachable("A", false);
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(coordinator.topology().primary().unwrap().id, "B");

        store.set_reachable("A", true);
        let w2 = coordinator
            .write(&ctx, ConsistencyLevel::Strong, "k", b"W2".to_vec())
            .await
            .unwrap();
        assert_eq!(w2.route.region_id, "B");
        coordinator.replication().wait_for(&w2.task_id).await.unwrap();

        assert_eq!(store.get("B", "k"), Some(b"W2".to_vec()));
        assert_eq!(store.get("C", "k"), Some(b"W2".to_vec()));
        assert_eq!(store.applied_sequences("B", "k"), vec![1, 2]);
        assert_eq!(store.applied_sequences("C", "k"), vec![1, 2]);
        assert!(coordinator.replication().task(&w1.task_id).unwrap().is_complete());

        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_eventual_fallback_source_keeps_newest_value() {
        let (coordinator, store, _) = coordinator();
        let ctx = RequestContext::anonymous();
        store.fail_applies("B", 1);

        let w1 = coordinator
            .write(&ctx, ConsistencyLevel::Eventual, "k", b"W1".to_vec())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        coordinator
            .registry()
            .set_role("A", RegionRole::Unreachable, "maintenance")
            .unwrap();
        let w2 = coordinator
            .write(&ctx, ConsistencyLevel::Eventual, "k", b"W2".to_vec())
            .await
            .unwrap();
        assert_eq!(w2.route.region_id, "B");
        assert!(!w2.route.is_primary);

        coordinator.replication().wait_for(&w1.task_id).await.unwrap();
        coordinator.replication().wait_for(&w2.task_id).await.unwrap();

        for region in ["A", "B", "C"] {
            assert_eq!(store.get(region, "k"), Some(b"W2".to_vec()));
        }
        assert_eq!(store.applied_sequences("B", "k"), vec![2]);
        assert_eq!(store.applied_sequences("C", "k"), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_strong_write_visible_to_strong_read() {
        let (coordinator, store, _) = coordinator();
        let ctx = RequestContext::from_region("C");

        coordinator
            .write(&ctx, ConsistencyLevel::Strong, "user:7", b"v2".to_vec())
            .await
            .unwrap();
        let read = coordinator.route_read(&ctx, ConsistencyLevel::Strong).unwrap();

        assert!(read.is_primary);
        assert_eq!(store.get(&read.region_id, "user:7"), Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn test_write_fans_out_to_standbys() {
        let (coordinator, store, _) = coordinator();
        let receipt = coordinator
            .write(&RequestContext::anonymous(), ConsistencyLevel::Eventual, "k", b"v".to_vec())
            .await
            .unwrap();

        let task = coordinator.replication().wait_for(&receipt.task_id).await.unwrap();
        assert!(task.is_fully_replicated());
        assert_eq!(store.get("B", "k"), Some(b"v".to_vec()));
        assert_eq!(store.get("C", "k"), Some(b"v".to_vec()));
        assert_eq!(coordinator.metrics().deliveries_acked, 2);
    }

    #[tokio::test]
    async fn test_status_report_and_primary_check() {
        let (coordinator, _, _) = coordinator();
        let report = coordinator.status_report();

        assert!(report.cluster.healthy);
        assert_eq!(report.cluster.primary.as_deref(), Some("A"));
        assert_eq!(report.regions.len(), 3);
        assert!(coordinator.is_primary(&RequestContext::from_region("A")));
        assert!(!coordinator.is_primary(&RequestContext::from_region("B")));
        assert!(!coordinator.is_primary(&RequestContext::anonymous()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent_and_shutdown_joins() {
        let (coordinator, _, _) = coordinator();
        coordinator.start();
        coordinator.start();
        assert_eq!(
            coordinator.handles.lock().unwrap().len(),
            5
        );

        coordinator.shutdown().await;
        assert!(coordinator.handles.lock().unwrap().is_empty());
        coordinator.shutdown().await;
    }
}
