//! Per-region store interface.
//!
//! The coordinator decides when and where to write or probe; how a region
//! persists data is the store's business.

use crate::core::{Error, Result, WritePayload};
use crate::region::topology::Region;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

/// Narrow interface to the store behind each region.
#[async_trait]
pub trait RegionStore: Send + Sync {
    /// Apply a write at a region.
    async fn apply(&self, region: &Region, payload: &WritePayload) -> Result<()>;

    /// Lightweight liveness check of a region.
    async fn probe(&self, region: &Region) -> Result<()>;
}

/// Fault-injection knobs and contents of one region.
#[derive(Debug, Default)]
struct RegionState {
    unreachable: bool,
    failing_applies: u32,
    latency: Duration,
    values: HashMap<String, WritePayload>,
    log: Vec<WritePayload>,
}

/// In-process store keeping every region's data in memory.
///
/// Supports unreachable regions, failing applies and injected latency.
#[derive(Debug, Default)]
pub struct MemoryStore {
    regions: RwLock<HashMap<String, RegionState>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_region<T>(&self, region_id: &str, f: impl FnOnce(&mut RegionState) -> T) -> T {
        let mut regions = self.regions.write().unwrap_or_else(PoisonError::into_inner);
        f(regions.entry(region_id.to_string()).or_default())
    }

    /// Make a region refuse probes and writes.
    pub fn set_reachable(&self, region_id: &str, reachable: bool) {
        self.with_region(region_id, |s| s.unreachable = !reachable);
    }

    /// Make the next `count` applies at a region fail.
    pub fn fail_applies(&self, region_id: &str, count: u32) {
        self.with_region(region_id, |s| s.failing_applies = count);
    }

    /// Delay every call to a region.
    pub fn set_latency(&self, region_id: &str, latency: Duration) {
        self.with_region(region_id, |s| s.latency = latency);
    }

    /// Latest value of a key at a region.
    pub fn get(&self, region_id: &str, key: &str) -> Option<Vec<u8>> {
        let regions = self.regions.read().unwrap_or_else(PoisonError::into_inner);
        regions
            .get(region_id)
            .and_then(|s| s.values.get(key))
            .map(|p| p.data.clone())
    }

    /// Writes applied at a region, in application order.
    pub fn applied(&self, region_id: &str) -> Vec<WritePayload> {
        let regions = self.regions.read().unwrap_or_else(PoisonError::into_inner);
        regions
            .get(region_id)
            .map(|s| s.log.clone())
            .unwrap_or_default()
    }

    /// Sequences applied at a region for one key, in application order.
    pub fn applied_sequences(&self, region_id: &str, key: &str) -> Vec<u64> {
        self.applied(region_id)
            .into_iter()
            .filter(|p| p.key == key)
            .map(|p| p.sequence)
            .collect()
    }

    fn latency(&self, region_id: &str) -> Duration {
        let regions = self.regions.read().unwrap_or_else(PoisonError::into_inner);
        regions.get(region_id).map(|s| s.latency).unwrap_or_default()
    }
}

#[async_trait]
impl RegionStore for MemoryStore {
    async fn apply(&self, region: &Region, payload: &WritePayload) -> Result<()> {
        let latency = self.latency(&region.id);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if !payload.verify() {
            return Err(Error::Store(format!(
                "digest mismatch for key {}",
                payload.key
            )));
        }

        self.with_region(&region.id, |state| {
            if state.unreachable {
                return Err(Error::Store(format!("region {} unreachable", region.id)));
            }
            if state.failing_applies > 0 {
                state.failing_applies -= 1;
                return Err(Error::Store(format!("write rejected by {}", region.id)));
            }
            state.values.insert(payload.key.clone(), payload.clone());
            state.log.push(payload.clone());
            Ok(())
        })
    }

    async fn probe(&self, region: &Region) -> Result<()> {
        let latency = self.latency(&region.id);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        self.with_region(&region.id, |state| {
            if state.unreachable {
                Err(Error::Store(format!("region {} unreachable", region.id)))
            } else {
                Ok(())
            }
        })
    }
}
