//! Coordinator configuration.
//!
//! Static region list plus tuning for health probing, replication and failover.
//! Loaded once at startup; any inconsistency is a fatal [`Error::Configuration`].

use crate::core::{Error, Result};
use crate::monitoring::logging::{LogLevel, LoggerConfig};
use crate::region::topology::RegionRole;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Probe class used when a region does not name one.
pub const DEFAULT_REGION_CLASS: &str = "cloud";

/// Static description of one region.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionConfig {
    /// Unique region id (location code)
    pub id: String,
    /// Address used for probes and routing
    pub endpoint: String,
    /// Initial role, `primary` or `standby`
    #[serde(default = "default_role")]
    pub role: RegionRole,
    /// Promotion priority, lower wins ties
    #[serde(default)]
    pub priority: u32,
    /// Probe class selecting the probe timeout
    #[serde(default)]
    pub class: Option<String>,
}

fn default_role() -> RegionRole {
    RegionRole::Standby
}

impl RegionConfig {
    /// Create a standby region.
    pub fn new(id: &str, endpoint: &str) -> Self {
        Self {
            id: id.to_string(),
            endpoint: endpoint.to_string(),
            role: RegionRole::Standby,
            priority: 0,
            class: None,
        }
    }

    /// Mark as the initial primary.
    pub fn as_primary(mut self) -> Self {
        self.role = RegionRole::Primary;
        self
    }

    /// Set promotion priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set probe class.
    pub fn with_class(mut self, class: &str) -> Self {
        self.class = Some(class.to_string());
        self
    }

    /// Probe class, falling back to the default class.
    pub fn class_name(&self) -> &str {
        self.class.as_deref().unwrap_or(DEFAULT_REGION_CLASS)
    }
}

/// Health probing configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between probes of one region (ms)
    pub probe_interval_ms: u64,
    /// Consecutive failures before a region is marked unhealthy
    pub failure_threshold: u32,
    /// Default per-probe timeout (ms)
    pub probe_timeout_ms: u64,
    /// Per-class probe timeouts (ms)
    pub class_timeouts_ms: HashMap<String, u64>,
    /// Reachable regions required for the cluster to report healthy
    pub min_reachable_regions: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 30_000,
            failure_threshold: 3,
            probe_timeout_ms: 5_000,
            class_timeouts_ms: HashMap::new(),
            min_reachable_regions: 1,
        }
    }
}

impl HealthConfig {
    /// Probe interval.
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    /// Probe timeout for a region class.
    pub fn probe_timeout_for(&self, class: &str) -> Duration {
        let ms = self
            .class_timeouts_ms
            .get(class)
            .copied()
            .unwrap_or(self.probe_timeout_ms);
        Duration::from_millis(ms)
    }
}

/// Replication delivery configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Fan out writes to other regions
    pub enabled: bool,
    /// First retry delay (ms)
    pub base_delay_ms: u64,
    /// Retry delay cap (ms)
    pub max_delay_ms: u64,
    /// Attempts per target before giving up
    pub max_attempts: u32,
    /// Timeout of one delivery attempt (ms)
    pub attempt_timeout_ms: u64,
    /// Random spread applied to each delay, fraction in [0, 1]
    pub jitter: f64,
    /// How long completed tasks are kept (seconds)
    pub retention_secs: u64,
    /// Interval of the task garbage collector (seconds)
    pub gc_interval_secs: u64,
    /// Restrict fan-out to these regions
    pub targets: Option<Vec<String>>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 5,
            attempt_timeout_ms: 5_000,
            jitter: 0.0,
            retention_secs: 3_600,
            gc_interval_secs: 60,
            targets: None,
        }
    }
}

impl ReplicationConfig {
    /// Timeout of one delivery attempt.
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Retention of completed tasks.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// GC interval.
    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs.max(1))
    }
}

/// Failover configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Promote automatically when the primary is lost
    pub auto_failover: bool,
    /// Healthy standbys required before any promotion
    pub min_healthy_standbys: usize,
    /// Bound on a promotion decision (ms)
    pub decision_window_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            auto_failover: true,
            min_healthy_standbys: 1,
            decision_window_ms: 10_000,
        }
    }
}

impl FailoverConfig {
    /// Promotion decision window.
    pub fn decision_window(&self) -> Duration {
        Duration::from_millis(self.decision_window_ms)
    }
}

/// Complete coordinator configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Static region list
    pub regions: Vec<RegionConfig>,
    /// Health probing
    #[serde(default)]
    pub health: HealthConfig,
    /// Replication
    #[serde(default)]
    pub replication: ReplicationConfig,
    /// Failover
    #[serde(default)]
    pub failover: FailoverConfig,
    /// Logging
    #[serde(default)]
    pub logging: LoggerConfig,
}

impl CoordinatorConfig {
    /// Create a configuration with default tuning.
    pub fn new(regions: Vec<RegionConfig>) -> Self {
        Self {
            regions,
            health: HealthConfig::default(),
            replication: ReplicationConfig::default(),
            failover: FailoverConfig::default(),
            logging: LoggerConfig::default(),
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: CoordinatorConfig = serde_json::from_str(json)
            .map_err(|e| Error::Configuration(format!("invalid configuration document: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Apply `REGION_COORD_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let number = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());
        let small = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u32>().ok());

        if let Some(v) = number("REGION_COORD_PROBE_INTERVAL_MS") {
            self.health.probe_interval_ms = v;
        }
        if let Some(v) = number("REGION_COORD_PROBE_TIMEOUT_MS") {
            self.health.probe_timeout_ms = v;
        }
        if let Some(v) = small("REGION_COORD_FAILURE_THRESHOLD") {
            self.health.failure_threshold = v;
        }
        if let Some(v) = small("REGION_COORD_MAX_ATTEMPTS") {
            self.replication.max_attempts = v;
        }
        if let Some(v) = number("REGION_COORD_DECISION_WINDOW_MS") {
            self.failover.decision_window_ms = v;
        }
        if let Some(level) = lookup("REGION_COORD_LOG_LEVEL").and_then(|v| LogLevel::parse(&v)) {
            self.logging.level = level;
        }
    }

    /// Check the configuration for a startable topology.
    pub fn validate(&self) -> Result<()> {
        if self.regions.is_empty() {
            return Err(Error::Configuration("no regions configured".to_string()));
        }

        let mut seen = HashSet::new();
        let mut primaries = Vec::new();
        for region in &self.regions {
            if region.id.trim().is_empty() {
                return Err(Error::Configuration("region with empty id".to_string()));
            }
            if !seen.insert(region.id.as_str()) {
                return Err(Error::Configuration(format!(
                    "duplicate region id: {}",
                    region.id
                )));
            }
            if region.endpoint.trim().is_empty() {
                return Err(Error::Configuration(format!(
                    "region {} has no endpoint",
                    region.id
                )));
            }
            match region.role {
                RegionRole::Primary => primaries.push(region.id.as_str()),
                RegionRole::Standby => {}
                other => {
                    return Err(Error::Configuration(format!(
                        "region {} has invalid initial role {}",
                        region.id, other
                    )))
                }
            }
        }
        if primaries.len() > 1 {
            return Err(Error::Configuration(format!(
                "more than one initial primary: {}",
                primaries.join(", ")
            )));
        }

        if self.health.failure_threshold == 0 {
            return Err(Error::Configuration("failure_threshold must be at least 1".to_string()));
        }
        if self.health.probe_interval_ms == 0 || self.health.probe_timeout_ms == 0 {
            return Err(Error::Configuration(
                "probe interval and timeout must be positive".to_string(),
            ));
        }

        let replication = &self.replication;
        if replication.max_attempts == 0 {
            return Err(Error::Configuration("max_attempts must be at least 1".to_string()));
        }
        if replication.base_delay_ms > replication.max_delay_ms {
            return Err(Error::Configuration(format!(
                "base_delay_ms ({}) exceeds max_delay_ms ({})",
                replication.base_delay_ms, replication.max_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&replication.jitter) {
            return Err(Error::Configuration(format!(
                "jitter {} outside [0, 1]",
                replication.jitter
            )));
        }
        if let Some(targets) = &replication.targets {
            for target in targets {
                if !seen.contains(target.as_str()) {
                    return Err(Error::Configuration(
                        Error::UnknownRegion(target.clone()).to_string(),
                    ));
                }
            }
        }

        if self.failover.decision_window_ms == 0 {
            return Err(Error::Configuration("decision_window_ms must be positive".to_string()));
        }

        Ok(())
    }

    /// Region configuration by id.
    pub fn region(&self, id: &str) -> Option<&RegionConfig> {
        self.regions.iter().find(|r| r.id == id)
    }
}
