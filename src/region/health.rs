//! Health monitoring.
//!
//! Every region is probed by its own loop, so a slow or dead region never
//! delays the assessment of the others. Each probe is bounded by the timeout of
//! the region's class; a timeout counts as a failure.

use crate::config::HealthConfig;
use crate::core::{Error, Result};
use crate::monitoring::metrics::CoordinatorMetrics;
use crate::region::registry::{ProbeResult, RegionRegistry};
use crate::region::store::RegionStore;
use crate::region::topology::Region;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

impl ProbeResult {
    /// The error this probe result stands for.
    pub fn to_error(&self, region_id: &str) -> Option<Error> {
        match self {
            ProbeResult::Success { .. } => None,
            ProbeResult::Timeout => Some(Error::ProbeTimeout(region_id.to_string())),
            ProbeResult::Failure(reason) => Some(Error::ProbeError {
                region: region_id.to_string(),
                reason: reason.clone(),
            }),
        }
    }
}

/// Periodic liveness prober.
pub struct HealthMonitor {
    /// Registry receiving results
    registry: Arc<RegionRegistry>,
    /// Store answering probes
    store: Arc<dyn RegionStore>,
    /// Intervals, timeouts and thresholds
    config: HealthConfig,
    /// Counters
    metrics: Arc<CoordinatorMetrics>,
}

impl HealthMonitor {
    /// Create a new monitor.
    pub fn new(
        registry: Arc<RegionRegistry>,
        store: Arc<dyn RegionStore>,
        config: HealthConfig,
        metrics: Arc<CoordinatorMetrics>,
    ) -> Self {
        Self {
            registry,
            store,
            config,
            metrics,
        }
    }

    /// Probe a region without recording the result.
    pub async fn probe_region(&self, region: &Region) -> ProbeResult {
        let timeout = self.config.probe_timeout_for(&region.class);
        let started = Instant::now();

        match tokio::time::timeout(timeout, self.store.probe(region)).await {
            Ok(Ok(())) => ProbeResult::Success {
                latency: started.elapsed(),
            },
            Ok(Err(e)) => ProbeResult::Failure(e.to_string()),
            Err(_) => ProbeResult::Timeout,
        }
    }

    /// Probe a region and record the result in the registry.
    pub async fn check_region(&self, region_id: &str) -> Result<ProbeResult> {
        let region = self
            .registry
            .region(region_id)
            .ok_or_else(|| Error::UnknownRegion(region_id.to_string()))?;

        let result = self.probe_region(&region).await;
        match result.to_error(region_id) {
            None => {
                self.metrics.probes_succeeded.inc();
                debug!(region = %region_id, result = ?result, "probe succeeded");
            }
            Some(err) => {
                self.metrics.probes_failed.inc();
                warn!(
                    region = %region_id,
                    failures = region.consecutive_failures + 1,
                    error = %err,
                    "probe failed"
                );
            }
        }

        self.registry.update_health(region_id, &result)?;
        Ok(result)
    }

    /// Probe every region concurrently and record the results.
    pub async fn check_all(&self) -> Vec<(String, ProbeResult)> {
        let snapshot = self.registry.list_regions();
        let ids: Vec<String> = snapshot.regions().map(|r| r.id.clone()).collect();

        let results = join_all(ids.iter().map(|id| self.check_region(id))).await;

        ids.into_iter()
            .zip(results)
            .filter_map(|(id, result)| match result {
                Ok(probe) => Some((id, probe)),
                Err(e) => {
                    warn!(region = %id, error = %e, "probe not recorded");
                    None
                }
            })
            .collect()
    }

    /// Spawn one probe loop per region.
    pub fn spawn(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        self.registry
            .list_regions()
            .regions()
            .map(|region| {
                let monitor = Arc::clone(self);
                let id = region.id.clone();
                tokio::spawn(monitor.probe_loop(id, shutdown.subscribe()))
            })
            .collect()
    }

    async fn probe_loop(self: Arc<Self>, region_id: String, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.probe_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(region = %region_id, "probe loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.check_region(&region_id).await {
                        warn!(region = %region_id, error = %e, "probe not recorded");
                    }
                }
            }
        }
    }
}
