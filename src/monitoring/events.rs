//! Structured coordinator events for the logging/alerting collaborator.
//!
//! Every role transition, exhausted replication delivery and suppressed or
//! aborted failover is emitted through an [`EventSink`].

use crate::core::{now, Timestamp};
use crate::region::topology::RegionRole;
use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock};
use tracing::{error, info, warn};

/// Alert severity level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertSeverity {
    /// Informational
    Info,
    /// Warning
    Warning,
    /// Critical
    Critical,
}

/// A coordinator event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    /// A region changed role.
    RoleTransition {
        region: String,
        from: RegionRole,
        to: RegionRole,
        reason: String,
        topology_version: u64,
    },
    /// A replication delivery exhausted its retries.
    ReplicationExhausted {
        task_id: String,
        key: String,
        target: String,
        attempts: u32,
        error: String,
    },
    /// Failover was needed but the guard refused to promote.
    FailoverSuppressed {
        healthy_standbys: usize,
        required: usize,
        reason: String,
    },
    /// A promotion did not settle and the candidate was reverted.
    PromotionAborted { region: String, reason: String },
    /// A standby became primary.
    PromotionCompleted {
        region: String,
        previous_primary: Option<String>,
        automatic: bool,
        duration_ms: u64,
    },
    /// A runtime operation referenced a region outside the configuration.
    UnknownRegion { region: String, operation: String },
}

impl CoordinatorEvent {
    /// Severity used for alert routing.
    pub fn severity(&self) -> AlertSeverity {
        match self {
            CoordinatorEvent::RoleTransition { to, .. } => match to {
                RegionRole::Unreachable => AlertSeverity::Warning,
                _ => AlertSeverity::Info,
            },
            CoordinatorEvent::ReplicationExhausted { .. } => AlertSeverity::Warning,
            CoordinatorEvent::FailoverSuppressed { .. } => AlertSeverity::Critical,
            CoordinatorEvent::PromotionAborted { .. } => AlertSeverity::Critical,
            CoordinatorEvent::PromotionCompleted { .. } => AlertSeverity::Warning,
            CoordinatorEvent::UnknownRegion { .. } => AlertSeverity::Warning,
        }
    }

    /// Short event name.
    pub fn name(&self) -> &'static str {
        match self {
            CoordinatorEvent::RoleTransition { .. } => "role_transition",
            CoordinatorEvent::ReplicationExhausted { .. } => "replication_exhausted",
            CoordinatorEvent::FailoverSuppressed { .. } => "failover_suppressed",
            CoordinatorEvent::PromotionAborted { .. } => "promotion_aborted",
            CoordinatorEvent::PromotionCompleted { .. } => "promotion_completed",
            CoordinatorEvent::UnknownRegion { .. } => "unknown_region",
        }
    }
}

/// An emitted event with identity and time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventRecord {
    /// Event ID
    pub id: String,
    /// Emission time
    pub timestamp: Timestamp,
    /// Severity
    pub severity: AlertSeverity,
    /// Payload
    pub event: CoordinatorEvent,
}

impl EventRecord {
    /// Wrap an event.
    pub fn new(event: CoordinatorEvent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: now(),
            severity: event.severity(),
            event,
        }
    }

    /// Format as JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Receiver of coordinator events.
pub trait EventSink: Send + Sync {
    /// Deliver one event. Must not block on I/O.
    fn emit(&self, event: CoordinatorEvent);
}

/// Writes events as structured tracing records.
#[derive(Clone, Debug, Default)]
pub struct TracingSink;

impl TracingSink {
    fn log(record: &EventRecord) {
        let name = record.event.name();
        let body = serde_json::to_string(&record.event).unwrap_or_default();
        match record.severity {
            AlertSeverity::Info => info!(event = name, id = %record.id, %body, "coordinator event"),
            AlertSeverity::Warning => warn!(event = name, id = %record.id, %body, "coordinator event"),
            AlertSeverity::Critical => error!(event = name, id = %record.id, %body, "coordinator alert"),
        }
    }
}

impl EventSink for TracingSink {
    fn emit(&self, event: CoordinatorEvent) {
        TracingSink::log(&EventRecord::new(event));
    }
}

/// Keeps a bounded in-memory history of events and forwards them to tracing.
pub struct RecordingSink {
    buffer: RwLock<Vec<EventRecord>>,
    max_buffer: usize,
}

impl RecordingSink {
    /// Create a sink keeping the last 1000 events.
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    /// Create a sink keeping the last `max_buffer` events.
    pub fn with_capacity(max_buffer: usize) -> Self {
        Self {
            buffer: RwLock::new(Vec::new()),
            max_buffer: max_buffer.max(1),
        }
    }

    /// All buffered records.
    pub fn records(&self) -> Vec<EventRecord> {
        self.buffer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Buffered events without their envelopes.
    pub fn events(&self) -> Vec<CoordinatorEvent> {
        self.records().into_iter().map(|r| r.event).collect()
    }

    /// Records at or above a severity.
    pub fn at_severity(&self, min: AlertSeverity) -> Vec<EventRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.severity >= min)
            .collect()
    }

    /// Number of buffered events with the given name.
    pub fn count(&self, name: &str) -> usize {
        self.buffer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.event.name() == name)
            .count()
    }

    /// Clear the buffer.
    pub fn clear(&self) {
        self.buffer
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: CoordinatorEvent) {
        let record = EventRecord::new(event);
        TracingSink::log(&record);

        let mut buffer = self.buffer.write().unwrap_or_else(PoisonError::into_inner);
        if buffer.len() >= self.max_buffer {
            buffer.remove(0);
        }
        buffer.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suppressed() -> CoordinatorEvent {
        CoordinatorEvent::FailoverSuppressed {
            healthy_standbys: 0,
            required: 1,
            reason: "no healthy standby".to_string(),
        }
    }

    #[test]
    fn test_severity_mapping() {
        let demoted = CoordinatorEvent::RoleTransition {
            region: "us-east".to_string(),
            from: RegionRole::Primary,
            to: RegionRole::Unreachable,
            reason: "probe failures".to_string(),
            topology_version: 4,
        };
        assert_eq!(demoted.severity(), AlertSeverity::Warning);
        assert_eq!(suppressed().severity(), AlertSeverity::Critical);
    }

    #[test]
    fn test_recording_sink_buffer() {
        let sink = RecordingSink::with_capacity(2);
        sink.emit(suppressed());
        sink.emit(CoordinatorEvent::UnknownRegion {
            region: "mars-1".to_string(),
            operation: "update_health".to_string(),
        });
        sink.emit(suppressed());

        assert_eq!(sink.records().len(), 2);
        assert_eq!(sink.count("failover_suppressed"), 1);
        assert_eq!(sink.at_severity(AlertSeverity::Critical).len(), 1);

        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_record_json() {
        let record = EventRecord::new(suppressed());
        let json = record.to_json();
        assert!(json.contains("failover_suppressed"));
        assert!(json.contains("Critical"));
    }
}
