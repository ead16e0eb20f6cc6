//! Consistency-aware request routing.
//!
//! Routing decisions are computed synchronously against the current topology
//! snapshot and never block on I/O. The router names a region; it does not
//! forward the request itself.

use crate::core::{Error, RequestContext, Result};
use crate::region::topology::{Region, TopologySnapshot};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// Per-request consistency policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyLevel {
    /// Reads from the nearest healthy region, writes through the primary
    #[default]
    Eventual,
    /// Reads and writes restricted to the primary
    Strong,
}

/// Where a request should go.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTarget {
    /// Target region
    pub region_id: String,
    /// Target endpoint
    pub endpoint: String,
    /// Caller runs in the target region
    pub colocated: bool,
    /// Target is the current primary
    pub is_primary: bool,
    /// Snapshot version the decision was made against
    pub topology_version: u64,
}

impl RouteTarget {
    fn new(region: &Region, ctx: &RequestContext, snapshot: &TopologySnapshot) -> Self {
        Self {
            region_id: region.id.clone(),
            endpoint: region.endpoint.clone(),
            colocated: ctx.is_in(&region.id),
            is_primary: region.is_primary(),
            topology_version: snapshot.version(),
        }
    }
}

/// Picks target regions for reads and writes.
#[derive(Clone)]
pub struct ConsistencyRouter {
    topology: watch::Receiver<Arc<TopologySnapshot>>,
}

impl ConsistencyRouter {
    /// Create a router following a topology channel.
    pub fn new(topology: watch::Receiver<Arc<TopologySnapshot>>) -> Self {
        Self { topology }
    }

    /// Snapshot the router currently decides against.
    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.topology.borrow().clone()
    }

    /// Route a read.
    pub fn route_read(&self, ctx: &RequestContext, level: ConsistencyLevel) -> Result<RouteTarget> {
        route_read_in(&self.snapshot(), ctx, level)
    }

    /// Route a write.
    pub fn route_write(&self, ctx: &RequestContext, level: ConsistencyLevel) -> Result<RouteTarget> {
        route_write_in(&self.snapshot(), ctx, level)
    }

    /// Nearest healthy region id.
    pub fn best_region(&self) -> Option<String> {
        self.snapshot().nearest_healthy().map(|r| r.id.clone())
    }
}

/// Route a read against an explicit snapshot.
pub fn route_read_in(
    snapshot: &TopologySnapshot,
    ctx: &RequestContext,
    level: ConsistencyLevel,
) -> Result<RouteTarget> {
    let region = match level {
        ConsistencyLevel::Eventual => snapshot.nearest_healthy().ok_or(Error::NoHealthyRegion)?,
        ConsistencyLevel::Strong => healthy_primary(snapshot)?,
    };
    Ok(RouteTarget::new(region, ctx, snapshot))
}

/// Route a write against an explicit snapshot.
///
/// Eventual writes go to the primary and fall back to the nearest healthy
/// region while no primary exists. Strong writes are rejected without one.
pub fn route_write_in(
    snapshot: &TopologySnapshot,
    ctx: &RequestContext,
    level: ConsistencyLevel,
) -> Result<RouteTarget> {
    let region = match (level, healthy_primary(snapshot)) {
        (_, Ok(primary)) => primary,
        (ConsistencyLevel::Strong, Err(e)) => return Err(e),
        (ConsistencyLevel::Eventual, Err(_)) => {
            snapshot.nearest_healthy().ok_or(Error::NoHealthyRegion)?
        }
    };
    Ok(RouteTarget::new(region, ctx, snapshot))
}

fn healthy_primary(snapshot: &TopologySnapshot) -> Result<&Region> {
    if snapshot.healthy_count() == 0 {
        return Err(Error::NoHealthyRegion);
    }
    snapshot
        .primary()
        .filter(|r| r.is_available())
        .ok_or(Error::NoPrimary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::topology::RegionRole;

    fn region(id: &str, latency: u64) -> Region {
        Region::new(id, &format!("https://{}", id)).with_latency(latency)
    }

    fn topology() -> TopologySnapshot {
        TopologySnapshot::new(vec![
            region("us-east", 80).as_primary(),
            region("eu-west", 15),
            region("ap-south", 150),
        ])
    }

    fn degrade(snapshot: &TopologySnapshot, ids: &[&str]) -> TopologySnapshot {
        let mut regions = snapshot.region_map();
        for id in ids {
            let r = regions.get_mut(*id).unwrap();
            r.healthy = false;
            r.role = RegionRole::Unreachable;
        }
        snapshot.successor(regions)
    }

    #[test]
    fn test_eventual_read_goes_to_nearest() {
        let route = route_read_in(&topology(), &RequestContext::anonymous(), ConsistencyLevel::Eventual)
            .unwrap();
        assert_eq!(route.region_id, "eu-west");
        assert!(!route.is_primary);
    }

    #[test]
    fn test_eventual_read_skips_unhealthy() {
        let snap = degrade(&topology(), &["eu-west"]);
        let route = route_read_in(&snap, &RequestContext::anonymous(), ConsistencyLevel::Eventual)
            .unwrap();
        assert_eq!(route.region_id, "us-east");
        assert_eq!(route.topology_version, 2);
    }

    #[test]
    fn test_strong_read_goes_to_primary() {
        let route = route_read_in(&topology(), &RequestContext::anonymous(), ConsistencyLevel::Strong)
            .unwrap();
        assert_eq!(route.region_id, "us-east");
        assert!(route.is_primary);
    }

    #[test]
    fn test_write_reports_colocation() {
        let snap = topology();
        let local = route_write_in(&snap, &RequestContext::from_region("us-east"), ConsistencyLevel::Eventual)
            .unwrap();
        assert!(local.colocated);
        assert_eq!(local.endpoint, "https://us-east");

        let remote = route_write_in(&snap, &RequestContext::from_region("ap-south"), ConsistencyLevel::Eventual)
            .unwrap();
        assert!(!remote.colocated);
        assert_eq!(remote.region_id, "us-east");
    }

    #[test]
    fn test_strong_write_without_primary_is_rejected() {
        let snap = degrade(&topology(), &["us-east"]);
        let err = route_write_in(&snap, &RequestContext::anonymous(), ConsistencyLevel::Strong)
            .unwrap_err();
        assert!(matches!(err, Error::NoPrimary));

        let err = route_read_in(&snap, &RequestContext::anonymous(), ConsistencyLevel::Strong)
            .unwrap_err();
        assert!(matches!(err, Error::NoPrimary));
    }

    #[test]
    fn test_eventual_write_without_primary_falls_back() {
        let snap = degrade(&topology(), &["us-east"]);
        let route = route_write_in(&snap, &RequestContext::anonymous(), ConsistencyLevel::Eventual)
            .unwrap();
        assert_eq!(route.region_id, "eu-west");
        assert!(!route.is_primary);
    }

    #[test]
    fn test_all_unhealthy_is_degraded() {
        let snap = degrade(&topology(), &["us-east", "eu-west", "ap-south"]);
        for level in [ConsistencyLevel::Eventual, ConsistencyLevel::Strong] {
            let ctx = RequestContext::anonymous();
            assert!(matches!(route_read_in(&snap, &ctx, level), Err(Error::NoHealthyRegion)));
            assert!(matches!(route_write_in(&snap, &ctx, level), Err(Error::NoHealthyRegion)));
        }
    }

    #[test]
    fn test_router_follows_channel() {
        let (tx, rx) = watch::channel(Arc::new(topology()));
        let router = ConsistencyRouter::new(rx);
        assert_eq!(router.best_region().as_deref(), Some("eu-west"));

        let next = degrade(&topology(), &["eu-west"]);
        tx.send_replace(Arc::new(next));
        assert_eq!(router.best_region().as_deref(), Some("us-east"));
        assert_eq!(router.snapshot().version(), 2);
    }
}
