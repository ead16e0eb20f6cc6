//! Multi-region Module
//!
//! Provides regional coordination:
//! - Region registry and topology snapshots
//! - Health monitoring
//! - Consistency-aware routing
//! - Replication fan-out
//! - Failover

pub mod failover;
pub mod health;
pub mod registry;
pub mod replication;
pub mod router;
pub mod status;
pub mod store;
pub mod topology;

pub use failover::{FailoverController, FailoverRecord};
pub use health::HealthMonitor;
pub use registry::{ProbeResult, RegionRegistry};
pub use replication::{
    DeliveryStatus, ReplicationCoordinator, ReplicationLag, ReplicationOutcome, ReplicationStats,
    ReplicationTask, RetryPolicy, TargetState,
};
pub use router::{ConsistencyLevel, ConsistencyRouter, RouteTarget};
pub use status::{ClusterHealth, RegionStatus, StatusReport};
pub use store::{MemoryStore, RegionStore};
pub use topology::{Region, RegionRole, TopologySnapshot};
