//! Monitoring Module
//!
//! Provides observability for the coordinator:
//! - Structured logging
//! - Coordinator events and alerts
//! - Counters

pub mod events;
pub mod logging;
pub mod metrics;

pub use events::{AlertSeverity, CoordinatorEvent, EventRecord, EventSink, RecordingSink, TracingSink};
pub use logging::{init_logging, LogFormat, LogLevel, LoggerConfig};
pub use metrics::{Counter, CoordinatorMetrics, MetricsSnapshot};
