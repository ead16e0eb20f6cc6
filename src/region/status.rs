//! Read-only status report for the operational health endpoint.

use crate::core::{Result, Timestamp};
use crate::region::topology::{RegionRole, TopologySnapshot};
use serde::{Deserialize, Serialize};

/// Status of one region.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionStatus {
    pub region: String,
    pub role: RegionRole,
    pub healthy: bool,
    pub latency_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub last_checked_at: Option<Timestamp>,
    pub last_error: Option<String>,
}

/// Overall cluster status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHealth {
    /// A primary exists and enough regions are reachable
    pub healthy: bool,
    pub primary: Option<String>,
    pub reachable: usize,
    pub required: usize,
}

/// Status of every region plus the cluster verdict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub topology_version: u64,
    pub regions: Vec<RegionStatus>,
    pub cluster: ClusterHealth,
}

impl StatusReport {
    /// Build a report from a snapshot. `required` is the minimum number of
    /// reachable regions for the cluster to count as healthy.
    pub fn from_snapshot(snapshot: &TopologySnapshot, required: usize) -> Self {
        let regions: Vec<RegionStatus> = snapshot
            .regions()
            .map(|r| RegionStatus {
                region: r.id.clone(),
                role: r.role,
                healthy: r.healthy,
                latency_ms: r.last_latency_ms,
                consecutive_failures: r.consecutive_failures,
                last_checked_at: r.last_checked_at,
                last_error: r.last_error.clone(),
            })
            .collect();

        let primary = snapshot.primary().map(|r| r.id.clone());
        let reachable = snapshot.regions().filter(|r| r.is_available()).count();

        Self {
            topology_version: snapshot.version(),
            regions,
            cluster: ClusterHealth {
                healthy: primary.is_some() && reachable >= required,
                primary,
                reachable,
                required,
            },
        }
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
