//! Region registry.
//!
//! Static catalog of configured regions whose health and roles mutate at
//! runtime. Every mutation publishes a new [`TopologySnapshot`] on a `watch`
//! channel; subscribers never observe a half-applied change.

use crate::config::CoordinatorConfig;
use crate::core::{now, Error, Result};
use crate::monitoring::events::{CoordinatorEvent, EventSink};
use crate::monitoring::metrics::CoordinatorMetrics;
use crate::region::topology::{Region, RegionRole, TopologySnapshot};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Outcome of one liveness probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeResult {
    /// The region answered within the timeout.
    Success { latency: Duration },
    /// The probe exceeded its timeout.
    Timeout,
    /// Connection or protocol failure.
    Failure(String),
}

impl ProbeResult {
    /// Check if the probe succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeResult::Success { .. })
    }

    /// Failure description, if any.
    pub fn error_message(&self) -> Option<String> {
        match self {
            ProbeResult::Success { .. } => None,
            ProbeResult::Timeout => Some("probe timed out".to_string()),
            ProbeResult::Failure(reason) => Some(reason.clone()),
        }
    }
}

struct RoleChange {
    region: String,
    from: RegionRole,
    to: RegionRole,
}

/// Registry of all configured regions.
pub struct RegionRegistry {
    /// Current topology, replaced on every change
    topology: watch::Sender<Arc<TopologySnapshot>>,
    /// Consecutive failures before a region is forced unreachable
    failure_threshold: u32,
    /// Event collaborator
    events: Arc<dyn EventSink>,
    /// Counters
    metrics: Arc<CoordinatorMetrics>,
}

impl RegionRegistry {
    /// Create a registry from validated configuration.
    pub fn new(
        config: &CoordinatorConfig,
        events: Arc<dyn EventSink>,
        metrics: Arc<CoordinatorMetrics>,
    ) -> Result<Self> {
        config.validate()?;

        let regions = config.regions.iter().map(Region::from_config).collect();
        let (topology, _) = watch::channel(Arc::new(TopologySnapshot::new(regions)));

        Ok(Self {
            topology,
            failure_threshold: config.health.failure_threshold,
            events,
            metrics,
        })
    }

    /// Current topology snapshot.
    pub fn list_regions(&self) -> Arc<TopologySnapshot> {
        self.topology.borrow().clone()
    }

    /// Subscribe to topology changes.
    pub fn subscribe(&self) -> watch::Receiver<Arc<TopologySnapshot>> {
        self.topology.subscribe()
    }

    /// Get a copy of a region.
    pub fn region(&self, region_id: &str) -> Option<Region> {
        self.topology.borrow().get(region_id).cloned()
    }

    /// Failure threshold in use.
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Record a probe result.
    ///
    /// Success resets the failure counter and returns an unreachable region to
    /// standby. Reaching the failure threshold marks the region unhealthy and
    /// forces it unreachable whatever its role.
    pub fn update_health(&self, region_id: &str, probe: &ProbeResult) -> Result<bool> {
        let threshold = self.failure_threshold;
        let reason = match probe.error_message() {
            None => "probe succeeded".to_string(),
            Some(_) => format!("{} consecutive probe failures", threshold),
        };

        self.publish("update_health", region_id, &reason, |regions| {
            let Some(region) = regions.get_mut(region_id) else {
                return;
            };
            region.last_checked_at = Some(now());

            match probe {
                ProbeResult::Success { latency } => {
                    region.consecutive_failures = 0;
                    region.healthy = true;
                    region.last_latency_ms = Some(latency.as_millis() as u64);
                    region.last_error = None;
                    if region.role == RegionRole::Unreachable {
                        region.role = RegionRole::Standby;
                        region.demoted_from_primary = false;
                    }
                }
                failed => {
                    region.consecutive_failures = region.consecutive_failures.saturating_add(1);
                    region.last_error = failed.error_message();
                    if region.consecutive_failures >= threshold {
                        region.healthy = false;
                        if region.role != RegionRole::Unreachable {
                            region.demoted_from_primary = region.role == RegionRole::Primary;
                            region.role = RegionRole::Unreachable;
                        }
                    }
                }
            }
        })
    }

    /// Administratively set a role.
    ///
    /// Setting `Primary` demotes any other primary to standby in the same snapshot.
    pub fn set_role(&self, region_id: &str, role: RegionRole, reason: &str) -> Result<bool> {
        self.publish("set_role", region_id, reason, |regions| {
            if role == RegionRole::Primary {
                for other in regions.values_mut() {
                    if other.id != region_id && other.role == RegionRole::Primary {
                        other.role = RegionRole::Standby;
                    }
                }
            }
            if let Some(region) = regions.get_mut(region_id) {
                region.role = role;
                if role != RegionRole::Unreachable {
                    region.demoted_from_primary = false;
                }
            }
        })
    }

    /// Change a role only if it currently equals `from`.
    ///
    /// A move to `Primary` is refused while another region holds that role.
    pub fn transition_role(
        &self,
        region_id: &str,
        from: RegionRole,
        to: RegionRole,
        reason: &str,
    ) -> Result<bool> {
        self.publish("transition_role", region_id, reason, |regions| {
            let conflict = to == RegionRole::Primary
                && regions
                    .values()
                    .any(|r| r.id != region_id && r.role == RegionRole::Primary);
            if conflict {
                return;
            }
            if let Some(region) = regions.get_mut(region_id) {
                if region.role == from {
                    region.role = to;
                }
            }
        })
    }

    /// Apply a change to a copy of the region map and publish it if anything differs.
    fn publish<F>(&self, operation: &str, region_id: &str, reason: &str, apply: F) -> Result<bool>
    where
        F: FnOnce(&mut BTreeMap<String, Region>),
    {
        let mut unknown = false;
        let mut changes = Vec::new();
        let mut version = 0;

        let changed = self.topology.send_if_modified(|current| {
            if !current.contains(region_id) {
                unknown = true;
                return false;
            }

            let mut regions = current.region_map();
            apply(&mut regions);
            if current.regions().eq(regions.values()) {
                return false;
            }

            for region in regions.values() {
                if let Some(before) = current.get(&region.id) {
                    if before.role != region.role {
                        changes.push(RoleChange {
                            region: region.id.clone(),
                            from: before.role,
                            to: region.role,
                        });
                    }
                }
            }

            let next = current.successor(regions);
            version = next.version();
            *current = Arc::new(next);
            true
        });

        if unknown {
            warn!(region = %region_id, operation, "ignoring operation on unknown region");
            self.events.emit(CoordinatorEvent::UnknownRegion {
                region: region_id.to_string(),
                operation: operation.to_string(),
            });
            return Err(Error::UnknownRegion(region_id.to_string()));
        }

        if changed {
            self.metrics.topology_publications.inc();
            debug!(version, operation, region = %region_id, "published topology snapshot");
        }

        for change in changes {
            info!(
                region = %change.region,
                from = %change.from,
                to = %change.to,
                version,
                reason,
                "region role changed"
            );
            self.events.emit(CoordinatorEvent::RoleTransition {
                region: change.region,
                from: change.from,
                to: change.to,
                reason: reason.to_string(),
                topology_version: version,
            });
        }

        Ok(changed)
    }
}
