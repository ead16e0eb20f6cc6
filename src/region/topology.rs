//! Regions and immutable topology snapshots.
//!
//! A [`TopologySnapshot`] is never edited in place. Every change produces a
//! successor with a strictly higher version, so a reader holding one snapshot
//! always sees a consistent whole.

use crate::config::RegionConfig;
use crate::core::{now, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Role of a region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionRole {
    /// Authoritative for strongly-consistent writes
    Primary,
    /// Receives asynchronous replication
    Standby,
    /// Failed too many consecutive probes
    Unreachable,
    /// Transient: being promoted to primary
    Promoting,
}

impl std::fmt::Display for RegionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegionRole::Primary => write!(f, "primary"),
            RegionRole::Standby => write!(f, "standby"),
            RegionRole::Unreachable => write!(f, "unreachable"),
            RegionRole::Promoting => write!(f, "promoting"),
        }
    }
}

/// A geographic region.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    /// Region ID
    pub id: String,
    /// Probe and routing address
    pub endpoint: String,
    /// Current role
    pub role: RegionRole,
    /// Promotion priority, lower wins
    pub priority: u32,
    /// Probe class
    pub class: String,
    /// Last-known liveness
    pub healthy: bool,
    /// Round-trip time of the last successful probe
    pub last_latency_ms: Option<u64>,
    /// Time of the last probe attempt
    pub last_checked_at: Option<Timestamp>,
    /// Failed probes since the last success
    pub consecutive_failures: u32,
    /// Reason of the last failed probe
    pub last_error: Option<String>,
    /// Was primary when it became unreachable
    pub demoted_from_primary: bool,
}

impl Region {
    /// Create a standby region.
    pub fn new(id: &str, endpoint: &str) -> Self {
        Self {
            id: id.to_string(),
            endpoint: endpoint.to_string(),
            role: RegionRole::Standby,
            priority: 0,
            class: crate::config::DEFAULT_REGION_CLASS.to_string(),
            healthy: true,
            last_latency_ms: None,
            last_checked_at: None,
            consecutive_failures: 0,
            last_error: None,
            demoted_from_primary: false,
        }
    }

    /// Build from static configuration.
    pub fn from_config(config: &RegionConfig) -> Self {
        Self {
            role: config.role,
            priority: config.priority,
            class: config.class_name().to_string(),
            ..Self::new(&config.id, &config.endpoint)
        }
    }

    /// Set as primary.
    pub fn as_primary(mut self) -> Self {
        self.role = RegionRole::Primary;
        self
    }

    /// Set latency.
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.last_latency_ms = Some(latency_ms);
        self
    }

    /// Check if this region is the primary.
    pub fn is_primary(&self) -> bool {
        self.role == RegionRole::Primary
    }

    /// Check if this region may serve requests.
    pub fn is_available(&self) -> bool {
        self.healthy && self.role != RegionRole::Unreachable
    }

    /// Ordering key for nearest-region selection: probed before unprobed,
    /// then latency, then id.
    pub(crate) fn latency_key(&self) -> (bool, u64, &str) {
        (
            self.last_latency_ms.is_none(),
            self.last_latency_ms.unwrap_or(u64::MAX),
            self.id.as_str(),
        )
    }
}

/// Immutable, versioned view of all regions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    version: u64,
    published_at: Timestamp,
    regions: BTreeMap<String, Region>,
}

impl TopologySnapshot {
    /// Create the first snapshot (version 1).
    pub fn new(regions: Vec<Region>) -> Self {
        Self {
            version: 1,
            published_at: now(),
            regions: regions.into_iter().map(|r| (r.id.clone(), r)).collect(),
        }
    }

    /// Successor snapshot with the given regions.
    pub(crate) fn successor(&self, regions: BTreeMap<String, Region>) -> Self {
        Self {
            version: self.version + 1,
            published_at: now(),
            regions,
        }
    }

    /// Copy of the region map for building a successor.
    pub(crate) fn region_map(&self) -> BTreeMap<String, Region> {
        self.regions.clone()
    }

    /// Snapshot version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Publication time.
    pub fn published_at(&self) -> Timestamp {
        self.published_at
    }

    /// Whether `other` supersedes this snapshot.
    pub fn is_stale_against(&self, other: &TopologySnapshot) -> bool {
        other.version > self.version
    }

    /// Get a region.
    pub fn get(&self, region_id: &str) -> Option<&Region> {
        self.regions.get(region_id)
    }

    /// Check if a region is configured.
    pub fn contains(&self, region_id: &str) -> bool {
        self.regions.contains_key(region_id)
    }

    /// All regions ordered by id.
    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    /// Region count.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether there are no regions.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// The primary region, if exactly one exists.
    pub fn primary(&self) -> Option<&Region> {
        let mut primaries = self.primaries();
        match primaries.len() {
            1 => primaries.pop(),
            _ => None,
        }
    }

    /// Every region currently in the primary role.
    pub fn primaries(&self) -> Vec<&Region> {
        self.regions().filter(|r| r.is_primary()).collect()
    }

    /// The region being promoted, if any.
    pub fn promoting(&self) -> Option<&Region> {
        self.regions().find(|r| r.role == RegionRole::Promoting)
    }

    /// Healthy regions.
    pub fn healthy_regions(&self) -> Vec<&Region> {
        self.regions().filter(|r| r.healthy).collect()
    }

    /// Number of healthy regions.
    pub fn healthy_count(&self) -> usize {
        self.regions().filter(|r| r.healthy).count()
    }

    /// Healthy standbys, the promotion candidates.
    pub fn healthy_standbys(&self) -> Vec<&Region> {
        self.regions()
            .filter(|r| r.healthy && r.role == RegionRole::Standby)
            .collect()
    }

    /// Healthy region with the lowest latency, ties by id.
    pub fn nearest_healthy(&self) -> Option<&Region> {
        self.regions()
            .filter(|r| r.is_available())
            .min_by(|a, b| a.latency_key().cmp(&b.latency_key()))
    }

    /// Whether no promotion is in flight and at most one primary exists.
    pub fn is_settled(&self) -> bool {
        self.promoting().is_none() && self.primaries().len() <= 1
    }
}
