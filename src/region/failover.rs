//! Failover for high availability.
//!
//! Watches the topology and, once no primary remains, promotes the healthy
//! standby with the lowest replication lag. Promotions are serialized by a
//! single-writer lock and bounded by the decision window.

use crate::config::FailoverConfig;
use crate::core::{now, Error, Result, Timestamp};
use crate::monitoring::events::{CoordinatorEvent, EventSink};
use crate::monitoring::metrics::CoordinatorMetrics;
use crate::region::registry::RegionRegistry;
use crate::region::replication::ReplicationLag;
use crate::region::store::RegionStore;
use crate::region::topology::{Region, RegionRole, TopologySnapshot};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Completed failover.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FailoverRecord {
    /// Record ID
    pub id: String,
    /// Primary that was lost or replaced
    pub failed_region: Option<String>,
    /// Region that became primary
    pub promoted_region: String,
    /// Completion time
    pub timestamp: Timestamp,
    /// Reason for failover
    pub reason: String,
    /// Was automatic
    pub automatic: bool,
    /// Duration of the promotion (ms)
    pub duration_ms: u64,
}

/// Promotes a standby when the primary is lost.
pub struct FailoverController {
    registry: Arc<RegionRegistry>,
    store: Arc<dyn RegionStore>,
    lag: Arc<dyn ReplicationLag>,
    config: FailoverConfig,
    events: Arc<dyn EventSink>,
    metrics: Arc<CoordinatorMetrics>,
    /// Single-writer promotion lock
    promotion: tokio::sync::Mutex<()>,
    history: RwLock<Vec<FailoverRecord>>,
    /// Candidate set of the last suppressed failover
    last_suppressed: Mutex<Option<Vec<String>>>,
}

impl FailoverController {
    /// Create a new controller.
    pub fn new(
        registry: Arc<RegionRegistry>,
        store: Arc<dyn RegionStore>,
        lag: Arc<dyn ReplicationLag>,
        config: FailoverConfig,
        events: Arc<dyn EventSink>,
        metrics: Arc<CoordinatorMetrics>,
    ) -> Self {
        Self {
            registry,
            store,
            lag,
            config,
            events,
            metrics,
            promotion: tokio::sync::Mutex::new(()),
            history: RwLock::new(Vec::new()),
            last_suppressed: Mutex::new(None),
        }
    }

    /// Healthy standbys in promotion order: lowest lag, then priority, then id.
    pub fn candidates(&self, snapshot: &TopologySnapshot) -> Vec<Region> {
        let mut candidates: Vec<(u64, Region)> = snapshot
            .healthy_standbys()
            .into_iter()
            .map(|r| (self.lag.replication_lag(&r.id), r.clone()))
            .collect();
        candidates.sort_by(|(lag_a, a), (lag_b, b)| {
            lag_a
                .cmp(lag_b)
                .then(a.priority.cmp(&b.priority))
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates.into_iter().map(|(_, r)| r).collect()
    }

    /// Whether a promotion currently holds the lock.
    pub fn promotion_in_flight(&self) -> bool {
        self.promotion.try_lock().is_err()
    }

    /// Check the current topology and promote a standby if no primary remains.
    ///
    /// Returns the failover performed, if any. Safe to call repeatedly: a
    /// topology that already has a primary, or is mid-promotion, is left alone.
    pub async fn evaluate(&self) -> Option<FailoverRecord> {
        let snapshot = self.registry.list_regions();
        if !snapshot.primaries().is_empty() {
            self.clear_suppressed();
            return None;
        }
        if !self.config.auto_failover || snapshot.promoting().is_some() {
            return None;
        }

        let Ok(_guard) = self.promotion.try_lock() else {
            debug!("promotion already in flight");
            return None;
        };

        let candidates = self.candidates(&snapshot);
        let required = self.config.min_healthy_standbys.max(1);
        if candidates.len() < required {
            self.suppress(&candidates, required);
            return None;
        }

        let failed = previous_primary(&snapshot);
        let candidate = &candidates[0];
        let reason = match &failed {
            Some(id) => format!("primary {} unreachable", id),
            None => "no primary configured".to_string(),
        };

        match self.promote(candidate, failed, &reason, true).await {
            Ok(record) => Some(record),
            Err(e) => {
                debug!(error = %e, "automatic promotion did not complete");
                None
            }
        }
    }

    /// Administratively promote a region, demoting any current primary to standby.
    pub async fn manual_promote(&self, region_id: &str, reason: &str) -> Result<FailoverRecord> {
        let _guard = self.promotion.lock().await;
        let started = Instant::now();
        let snapshot = self.registry.list_regions();

        let region = snapshot
            .get(region_id)
            .ok_or_else(|| Error::UnknownRegion(region_id.to_string()))?;
        if !region.healthy {
            return Err(Error::PromotionAborted {
                region: region_id.to_string(),
                reason: "region is not healthy".to_string(),
            });
        }

        let failed = snapshot
            .primary()
            .map(|r| r.id.clone())
            .filter(|id| id != region_id)
            .or_else(|| previous_primary(&snapshot));

        self.registry.set_role(region_id, RegionRole::Primary, reason)?;
        Ok(self.complete(region_id, failed, reason, false, started))
    }

    /// Full failover history.
    pub fn history(&self) -> Vec<FailoverRecord> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Most recent failovers, newest first.
    pub fn recent_failovers(&self, n: usize) -> Vec<FailoverRecord> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .take(n)
            .cloned()
            .collect()
    }

    /// Spawn the watcher evaluating every topology change.
    pub fn spawn(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        let mut topology = self.registry.subscribe();

        tokio::spawn(async move {
            loop {
                controller.evaluate().await;
                tokio::select! {
                    _ = shutdown.recv() => break,
                    changed = topology.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("failover watcher stopped");
        })
    }

    async fn promote(
        &self,
        candidate: &Region,
        failed: Option<String>,
        reason: &str,
        automatic: bool,
    ) -> Result<FailoverRecord> {
        let started = Instant::now();
        let window = self.config.decision_window();
        info!(region = %candidate.id, failed = ?failed, reason, "promoting standby");

        let outcome = match tokio::time::timeout(window, self.run_promotion(candidate, reason)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(format!("promotion not settled within {:?}", window)),
        };

        match outcome {
            Ok(()) => Ok(self.complete(&candidate.id, failed, reason, automatic, started)),
            Err(why) => Err(self.abort(&candidate.id, why)),
        }
    }

    async fn run_promotion(&self, candidate: &Region, reason: &str) -> std::result::Result<(), String> {
        let promoting = self
            .registry
            .transition_role(&candidate.id, RegionRole::Standby, RegionRole::Promoting, reason)
            .map_err(|e| e.to_string())?;
        if !promoting {
            return Err("candidate is no longer a standby".to_string());
        }

        self.store
            .probe(candidate)
            .await
            .map_err(|e| format!("confirmation probe failed: {}", e))?;

        let promoted = self
            .registry
            .transition_role(&candidate.id, RegionRole::Promoting, RegionRole::Primary, reason)
            .map_err(|e| e.to_string())?;
        if !promoted {
            return Err("conflicting primary appeared during promotion".to_string());
        }
        Ok(())
    }

    fn complete(
        &self,
        region_id: &str,
        failed: Option<String>,
        reason: &str,
        automatic: bool,
        started: Instant,
    ) -> FailoverRecord {
        let record = FailoverRecord {
            id: uuid::Uuid::new_v4().to_string(),
            failed_region: failed.clone(),
            promoted_region: region_id.to_string(),
            timestamp: now(),
            reason: reason.to_string(),
            automatic,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        self.metrics.failovers_completed.inc();
        self.clear_suppressed();
        info!(
            region = %region_id,
            previous = ?failed,
            automatic,
            duration_ms = record.duration_ms,
            "promotion completed"
        );
        self.events.emit(CoordinatorEvent::PromotionCompleted {
            region: region_id.to_string(),
            previous_primary: failed,
            automatic,
            duration_ms: record.duration_ms,
        });

        self.history
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        record
    }

    /// Revert a half-promoted candidate to unreachable.
    fn abort(&self, region_id: &str, reason: String) -> Error {
        if let Err(e) = self.registry.transition_role(
            region_id,
            RegionRole::Promoting,
            RegionRole::Unreachable,
            "promotion aborted",
        ) {
            warn!(region = %region_id, error = %e, "could not revert aborted promotion");
        }

        self.metrics.promotions_aborted.inc();
        warn!(region = %region_id, reason = %reason, "promotion aborted");
        self.events.emit(CoordinatorEvent::PromotionAborted {
            region: region_id.to_string(),
            reason: reason.clone(),
        });
        Error::PromotionAborted {
            region: region_id.to_string(),
            reason,
        }
    }

    fn suppress(&self, candidates: &[Region], required: usize) {
        let ids: Vec<String> = candidates.iter().map(|r| r.id.clone()).collect();
        let mut last = self
            .last_suppressed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if last.as_ref() == Some(&ids) {
            return;
        }

        let reason = if ids.is_empty() {
            "no healthy standby qualifies".to_string()
        } else {
            format!("{} healthy standbys, {} required", ids.len(), required)
        };
        self.metrics.failovers_suppressed.inc();
        warn!(healthy_standbys = ids.len(), required, reason = %reason, "failover suppressed");
        self.events.emit(CoordinatorEvent::FailoverSuppressed {
            healthy_standbys: ids.len(),
            required,
            reason,
        });
        *last = Some(ids);
    }

    fn clear_suppressed(&self) {
        *self
            .last_suppressed
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

fn previous_primary(snapshot: &TopologySnapshot) -> Option<String> {
    snapshot
        .regions()
        .find(|r| r.demoted_from_primary)
        .map(|r| r.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoordinatorConfig, RegionConfig};
    use crate::monitoring::events::RecordingSink;
    use crate::region::registry::ProbeResult;
    use crate::region::store::MemoryStore;
    use std::collections::HashMap;
    use std::time::Duration;

    #[derive(Default)]
    struct FixedLag(HashMap<String, u64>);

    impl ReplicationLag for FixedLag {
        fn replication_lag(&self, region_id: &str) -> u64 {
            self.0.get(region_id).copied().unwrap_or(0)
        }
    }

    struct Fixture {
        controller: Arc<FailoverController>,
        registry: Arc<RegionRegistry>,
        store: Arc<MemoryStore>,
        sink: Arc<RecordingSink>,
        metrics: Arc<CoordinatorMetrics>,
    }

    fn fixture(lag: &[(&str, u64)], configure: impl FnOnce(&mut CoordinatorConfig)) -> Fixture {
        let mut config = CoordinatorConfig::new(vec![
            RegionConfig::new("A", "https://a").as_primary(),
            RegionConfig::new("B", "https://b").with_priority(2),
            RegionConfig::new("C", "https://c").with_priority(1),
        ]);
        configure(&mut config);

        let sink = Arc::new(RecordingSink::new());
        let metrics = Arc::new(CoordinatorMetrics::new());
        let registry = Arc::new(RegionRegistry::new(&config, sink.clone(), metrics.clone()).unwrap());
        let store = Arc::new(MemoryStore::new());
        let lag = FixedLag(lag.iter().map(|(id, n)| (id.to_string(), *n)).collect());
        let controller = Arc::new(FailoverController::new(
            registry.clone(),
            store.clone(),
            Arc::new(lag),
            config.failover.clone(),
            sink.clone(),
            metrics.clone(),
        ));
        Fixture {
            controller,
            registry,
            store,
            sink,
            metrics,
        }
    }

    fn fail(registry: &RegionRegistry, id: &str, times: u32) {
        for _ in 0..times {
            registry
                .update_health(id, &ProbeResult::Failure("connection refused".into()))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_no_action_while_primary_exists() {
        let f = fixture(&[], |_| {});
        assert!(f.controller.evaluate().await.is_none());
        assert!(f.controller.history().is_empty());
        assert_eq!(f.registry.list_regions().primary().unwrap().id, "A");
    }

    #[tokio::test]
    async fn test_promotes_lowest_lag_standby() {
        let f = fixture(&[("B", 0), ("C", 4)], |_| {});
        fail(&f.registry, "A", 3);

        let record = f.controller.evaluate().await.unwrap();
        assert_eq!(record.promoted_region, "B");
        assert_eq!(record.failed_region.as_deref(), Some("A"));
        assert!(record.automatic);

        let snapshot = f.registry.list_regions();
        assert_eq!(snapshot.primary().unwrap().id, "B");
        assert_eq!(snapshot.get("A").unwrap().role, RegionRole::Unreachable);
        assert!(snapshot.is_settled());
        assert_eq!(f.sink.count("promotion_completed"), 1);
        assert_eq!(f.metrics.snapshot().failovers_completed, 1);
    }

    #[tokio::test]
    async fn test_equal_lag_falls_back_to_priority() {
        let f = fixture(&[], |_| {});
        fail(&f.registry, "A", 3);

        let record = f.controller.evaluate().await.unwrap();
        assert_eq!(record.promoted_region, "C");
    }

    #[tokio::test]
    async fn test_repeated_demotion_triggers_one_failover() {
        let f = fixture(&[], |_| {});
        fail(&f.registry, "A", 3);
        f.controller.evaluate().await.unwrap();

        fail(&f.registry, "A", 5);
        assert!(f.controller.evaluate().await.is_none());
        assert!(f.controller.evaluate().await.is_none());
        assert_eq!(f.controller.history().len(), 1);
        assert_eq!(f.sink.count("promotion_completed"), 1);
    }

    #[tokio::test]
    async fn test_recovered_primary_rejoins_as_standby() {
        let f = fixture(&[], |_| {});
        fail(&f.registry, "A", 3);
        f.controller.evaluate().await.unwrap();

        f.registry
            .update_health("A", &ProbeResult::Success { latency: Duration::from_millis(5) })
            .unwrap();
        assert!(f.controller.evaluate().await.is_none());

        let snapshot = f.registry.list_regions();
        assert_eq!(snapshot.get("A").unwrap().role, RegionRole::Standby);
        assert_eq!(snapshot.primary().unwrap().id, "C");
    }

    #[tokio::test]
    async fn test_suppressed_without_healthy_standby() {
        let f = fixture(&[], |_| {});
        fail(&f.registry, "B", 3);
        fail(&f.registry, "C", 3);
        fail(&f.registry, "A", 3);

        assert!(f.controller.evaluate().await.is_none());
        assert!(f.controller.evaluate().await.is_none());
        assert!(f.registry.list_regions().primaries().is_empty());

        // Alerted once per distinct candidate set.
        assert_eq!(f.sink.count("failover_suppressed"), 1);
        assert_eq!(f.metrics.snapshot().failovers_suppressed, 1);
    }

    #[tokio::test]
    async fn test_guard_requires_configured_standbys() {
        let f = fixture(&[], |c| c.failover.min_healthy_standbys = 3);
        fail(&f.registry, "A", 3);

        assert!(f.controller.evaluate().await.is_none());
        let events = f.sink.events();
        assert!(events.iter().any(|e| matches!(
            e,
            CoordinatorEvent::FailoverSuppressed { healthy_standbys: 2, required: 3, .. }
        )));
    }

    #[tokio::test]
    async fn test_auto_failover_disabled() {
        let f = fixture(&[], |c| c.failover.auto_failover = false);
        fail(&f.registry, "A", 3);
        assert!(f.controller.evaluate().await.is_none());
        assert!(f.registry.list_regions().primaries().is_empty());
    }

    #[tokio::test]
    async fn test_failed_confirmation_aborts() {
        let f = fixture(&[("B", 0), ("C", 4)], |_| {});
        fail(&f.registry, "A", 3);
        f.store.set_reachable("B", false);

        assert!(f.controller.evaluate().await.is_none());
        let snapshot = f.registry.list_regions();
        assert_eq!(snapshot.get("B").unwrap().role, RegionRole::Unreachable);
        assert!(snapshot.promoting().is_none());
        assert_eq!(f.sink.count("promotion_aborted"), 1);

        // The next evaluation moves on to the remaining candidate.
        let record = f.controller.evaluate().await.unwrap();
        assert_eq!(record.promoted_region, "C");
    }

    #[tokio::test(start_paused = true)]
    async fn test_promotion_bounded_by_decision_window() {
        let f = fixture(&[("B", 0), ("C", 4)], |_| {});
        fail(&f.registry, "A", 3);
        f.store.set_latency("B", Duration::from_secs(60));

        assert!(!f.controller.promotion_in_flight());
        let started = Instant::now();
        let controller = f.controller.clone();
        let evaluation = tokio::spawn(async move { controller.evaluate().await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(f.controller.promotion_in_flight());
        assert_eq!(f.registry.region("B").unwrap().role, RegionRole::Promoting);

        assert!(evaluation.await.unwrap().is_none());
        assert!(started.elapsed() <= Duration::from_secs(11));
        assert!(!f.controller.promotion_in_flight());
        assert_eq!(
            f.registry.region("B").unwrap().role,
            RegionRole::Unreachable
        );
        assert_eq!(f.metrics.snapshot().promotions_aborted, 1);
    }

    #[tokio::test]
    async fn test_primaryless_startup_is_promoted() {
        let f = fixture(&[], |c| c.regions[0].role = RegionRole::Standby);
        let record = f.controller.evaluate().await.unwrap();
        assert_eq!(record.failed_region, None);
        assert_eq!(record.promoted_region, "A");
    }

    #[tokio::test]
    async fn test_manual_promote_reinstates_old_primary() {
        let f = fixture(&[], |_| {});
        fail(&f.registry, "A", 3);
        f.controller.evaluate().await.unwrap();
        f.registry
            .update_health("A", &ProbeResult::Success { latency: Duration::from_millis(5) })
            .unwrap();

        let record = f.controller.manual_promote("A", "operator reinstatement").await.unwrap();
        assert!(!record.automatic);
        assert_eq!(record.failed_region.as_deref(), Some("C"));

        let snapshot = f.registry.list_regions();
        assert_eq!(snapshot.primary().unwrap().id, "A");
        assert_eq!(snapshot.get("C").unwrap().role, RegionRole::Standby);
        assert_eq!(f.controller.recent_failovers(1)[0].promoted_region, "A");
    }

    #[tokio::test]
    async fn test_manual_promote_rejects_unhealthy_or_unknown() {
        let f = fixture(&[], |_| {});
        fail(&f.registry, "B", 3);
        assert!(matches!(
            f.controller.manual_promote("B", "test").await,
            Err(Error::PromotionAborted { .. })
        ));
        assert!(matches!(
            f.controller.manual_promote("Z", "test").await,
            Err(Error::UnknownRegion(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_reacts_to_topology_changes() {
        let f = fixture(&[], |_| {});
        let (shutdown, _) = broadcast::channel(1);
        let handle = f.controller.spawn(shutdown.subscribe());

        fail(&f.registry, "A", 3);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.registry.list_regions().primary().unwrap().id, "C");

        shutdown.send(()).unwrap();
        handle.await.unwrap();
    }
}
