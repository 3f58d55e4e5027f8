/// Worker lifecycle audit trail for confine
/// Emits one structured JSON record per lifecycle event on the `confine::audit`
/// log target, correlated by the owning coordinator's id.
use log::Level;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::SystemTime;
use uuid::Uuid;

/// Log target every audit record is written to
pub const AUDIT_TARGET: &str = "confine::audit";

/// Audit event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl Severity {
    fn level(self) -> Level {
        match self {
            Severity::High => Level::Error,
            Severity::Medium => Level::Warn,
            Severity::Low => Level::Info,
        }
    }
}

/// Types of lifecycle events we track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleEventType {
    WorkerSpawned,
    WorkerReused,
    WorkerReplaced,
    WorkerReaped,
    TaskTimeout,
    WorkerLost,
    TransmissionFailure,
    ForcedKill,
    CoordinatorClosed,
}

impl LifecycleEventType {
    pub fn default_severity(&self) -> Severity {
        match self {
            LifecycleEventType::WorkerSpawned
            | LifecycleEventType::WorkerReused
            | LifecycleEventType::WorkerReaped
            | LifecycleEventType::CoordinatorClosed => Severity::Low,
            LifecycleEventType::WorkerReplaced | LifecycleEventType::TransmissionFailure => {
                Severity::Medium
            }
            LifecycleEventType::TaskTimeout
            | LifecycleEventType::WorkerLost
            | LifecycleEventType::ForcedKill => Severity::High,
        }
    }
}

/// Individual lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub event_type: LifecycleEventType,
    pub severity: Severity,
    pub timestamp: SystemTime,
    pub details: String,
    pub worker_pid: Option<i32>,
    pub task_id: Option<Uuid>,
}

impl LifecycleEvent {
    /// Create a new event with default severity
    pub fn new(event_type: LifecycleEventType, details: impl Into<String>) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            timestamp: SystemTime::now(),
            details: details.into(),
            worker_pid: None,
            task_id: None,
        }
    }

    pub fn with_worker_pid(mut self, pid: i32) -> Self {
        self.worker_pid = Some(pid);
        self
    }

    pub fn with_task_id(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }
}

/// Per-coordinator audit trail
pub struct AuditLog {
    coordinator_id: Uuid,
    recorded: Option<Mutex<Vec<LifecycleEvent>>>,
}

impl AuditLog {
    pub fn new(coordinator_id: Uuid) -> Self {
        Self {
            coordinator_id,
            recorded: None,
        }
    }

    /// Also keep every emitted event in memory (see [`AuditLog::events`])
    pub fn recording(coordinator_id: Uuid) -> Self {
        Self {
            coordinator_id,
            recorded: Some(Mutex::new(Vec::new())),
        }
    }

    pub fn coordinator_id(&self) -> Uuid {
        self.coordinator_id
    }

    pub fn emit(&self, event: LifecycleEvent) {
        let level = event.severity.level();
        if log::log_enabled!(target: AUDIT_TARGET, level) {
            let entry = serde_json::json!({
                "timestamp": event.timestamp
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as u64,
                "coordinator_id": self.coordinator_id,
                "event_type": event.event_type,
                "severity": event.severity,
                "details": event.details,
                "worker_pid": event.worker_pid,
                "task_id": event.task_id,
                "process_id": std::process::id(),
            });
            log::log!(target: AUDIT_TARGET, level, "{}", entry);
        }

        if let Some(recorded) = &self.recorded {
            match recorded.lock() {
                Ok(mut events) => events.push(event),
                Err(poisoned) => poisoned.into_inner().push(event),
            }
        }
    }

    /// Events emitted so far; empty unless created with [`AuditLog::recording`]
    pub fn events(&self) -> Vec<LifecycleEvent> {
        match &self.recorded {
            Some(recorded) => match recorded.lock() {
                Ok(events) => events.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            },
            None => Vec::new(),
        }
    }

    /// Number of recorded events of `event_type`
    pub fn count(&self, event_type: LifecycleEventType) -> usize {
        self.events()
            .iter()
            .filter(|event| event.event_type == event_type)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_log_keeps_events_in_order() {
        let audit = AuditLog::recording(Uuid::new_v4());
        audit.emit(LifecycleEvent::new(LifecycleEventType::WorkerSpawned, "spawned").with_worker_pid(10));
        audit.emit(LifecycleEvent::new(LifecycleEventType::TaskTimeout, "late").with_worker_pid(10));

        let events = audit.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].severity, Severity::High);
        assert_eq!(audit.count(LifecycleEventType::WorkerSpawned), 1);
    }

    #[test]
    fn plain_log_records_nothing() {
        let audit = AuditLog::new(Uuid::new_v4());
        audit.emit(LifecycleEvent::new(LifecycleEventType::WorkerReaped, "gone"));
        assert!(audit.events().is_empty());
    }
}
