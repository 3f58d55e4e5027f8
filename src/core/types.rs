use crate::config::types::{ConfigSnapshot, ConfinedError, SandboxError};
use crate::exec::function::Args;
use crate::exec::script::Code;
use crate::value::{Namespace, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Coordinator -> worker work item. Exactly one [`TaskResult`] answers it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub config: ConfigSnapshot,
    pub payload: TaskPayload,
}

impl Task {
    pub fn new(config: ConfigSnapshot, payload: TaskPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            payload,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    /// Call a registered function by name
    Call { function: String, args: Args },
    /// Run a code block against copies of the caller's namespaces
    Execute {
        code: Code,
        globals: Namespace,
        locals: Option<Namespace>,
    },
}

impl TaskPayload {
    /// Short description for logs and audit events
    pub fn label(&self) -> &str {
        match self {
            TaskPayload::Call { function, .. } => function,
            TaskPayload::Execute { .. } => "execute",
        }
    }
}

/// Worker -> coordinator answer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub outcome: WireOutcome,
    /// Post-run globals of an `Execute` task, injected bindings stripped
    pub globals: Option<Namespace>,
    pub locals: Option<Namespace>,
}

impl TaskResult {
    /// Answer to a task frame the worker could not decode. It carries the
    /// nil id, as the task's own id was never read.
    pub fn unreadable(reason: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::nil(),
            outcome: WireOutcome::Rejected {
                reason: format!("worker could not read the task: {}", reason.into()),
            },
            globals: None,
            locals: None,
        }
    }

    pub fn is_unreadable(&self) -> bool {
        self.task_id.is_nil() && matches!(self.outcome, WireOutcome::Rejected { .. })
    }
}

/// How a task ended, as data
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WireOutcome {
    Success { value: Value },
    Confined { error: ConfinedError },
    Protection { name: String, message: String },
    /// The worker refused the task without running it
    Rejected { reason: String },
}

impl WireOutcome {
    /// Wrap the result of the guarded path for transport
    pub fn from_result(result: crate::config::types::Result<Value>) -> Self {
        match result {
            Ok(value) => WireOutcome::Success { value },
            Err(SandboxError::Confined(error)) => WireOutcome::Confined { error },
            Err(SandboxError::Protection { name, message }) => {
                WireOutcome::Protection { name, message }
            }
            Err(other) => WireOutcome::Rejected {
                reason: other.to_string(),
            },
        }
    }

    /// Rebuild the caller-side result; content errors keep kind and message
    pub fn into_result(self) -> crate::config::types::Result<Value> {
        match self {
            WireOutcome::Success { value } => Ok(value),
            WireOutcome::Confined { error } => Err(SandboxError::Confined(error)),
            WireOutcome::Protection { name, message } => {
                Err(SandboxError::Protection { name, message })
            }
            WireOutcome::Rejected { reason } => Err(SandboxError::Transmission(reason)),
        }
    }
}

/// Lifecycle state of a worker handle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    Idle,
    Busy,
    Terminated,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Idle => "idle",
            WorkerState::Busy => "busy",
            WorkerState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Signal escalation report for timeout/forced termination paths.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KillReport {
    pub term_sent: bool,
    pub kill_sent: bool,
    pub reaped: bool,
    pub exit_status: Option<String>,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_round_trips_through_result() {
        let err = ConfinedError::new("KeyError", "'missing'");
        let outcome = WireOutcome::from_result(Err(SandboxError::Confined(err.clone())));
        assert_eq!(outcome, WireOutcome::Confined { error: err.clone() });
        let back = outcome.into_result().unwrap_err();
        assert_eq!(back.as_confined(), Some(&err));
    }

    #[test]
    fn rejected_tasks_surface_as_transmission_errors() {
        let outcome = WireOutcome::Rejected {
            reason: "unknown function 'f'".to_string(),
        };
        assert!(matches!(
            outcome.into_result(),
            Err(SandboxError::Transmission(reason)) if reason.contains("'f'")
        ));
    }

    #[test]
    fn task_payload_is_tagged_on_the_wire() {
        let payload = TaskPayload::Call {
            function: "add".to_string(),
            args: Args::new().arg(1),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "call");
        assert_eq!(json["function"], "add");
        assert_eq!(payload.label(), "add");
    }
}
