//! # region-coordinator - Multi-Region Coordination & Failover
//!
//! Keeps a set of geographically distributed regions serving traffic:
//! - **Registry**: immutable, versioned topology snapshots
//! - **Health**: concurrent per-region liveness probing
//! - **Routing**: eventual and strong consistency request routing
//! - **Replication**: per-target fan-out with bounded exponential backoff
//! - **Failover**: automatic promotion of the least-lagging healthy standby
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use region_coordinator::{
//!     ConsistencyLevel, CoordinatorConfig, MemoryStore, RegionConfig, RegionCoordinator,
//!     RequestContext, TracingSink,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = CoordinatorConfig::new(vec![
//!         RegionConfig::new("us-east", "https://us-east.internal").as_primary(),
//!         RegionConfig::new("eu-west", "https://eu-west.internal"),
//!     ]);
//!     region_coordinator::monitoring::init_logging(&config.logging);
//!     let coordinator =
//!         RegionCoordinator::new(config, Arc::new(MemoryStore::new()), Arc::new(TracingSink)).unwrap();
//!     coordinator.start();
//!
//!     let ctx = RequestContext::from_region("eu-west");
//!     let route = coordinator.route_read(&ctx, ConsistencyLevel::Eventual).unwrap();
//!     println!("read from {}", route.endpoint);
//!
//!     coordinator.shutdown().await;
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod core;
pub mod monitoring;
pub mod region;

pub use config::{CoordinatorConfig, FailoverConfig, HealthConfig, RegionConfig, ReplicationConfig};
pub use coordinator::{RegionCoordinator, WriteReceipt};
pub use core::error::{Error, Result};
pub use core::types::{RequestContext, WritePayload};
pub use monitoring::{CoordinatorEvent, EventSink, RecordingSink, TracingSink};
pub use region::{
    ConsistencyLevel, MemoryStore, Region, RegionRole, RegionStore, RouteTarget, StatusReport,
    TopologySnapshot,
};
