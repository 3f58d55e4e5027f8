/// Core configuration and error types for confine
use crate::protection::Protection;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Default answer deadline for a confined call
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default address-space cap applied to worker processes (512 MiB)
pub const DEFAULT_MAX_MEMORY: u64 = 512 * 1024 * 1024;

/// Default interval at which an idle worker wakes up to check its owner
pub const DEFAULT_WORKER_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default delay between SIGTERM and SIGKILL when terminating a worker
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(200);

/// Default upper bound on waiting for a terminated worker to be reaped
pub const DEFAULT_REAP_TIMEOUT: Duration = Duration::from_secs(1);

/// Confinement policy for one coordinator.
///
/// A config is an immutable snapshot once handed to an
/// [`ExecutionCoordinator`](crate::core::coordinator::ExecutionCoordinator):
/// tasks built from it carry a [`ConfigSnapshot`] and never observe later edits.
#[derive(Clone)]
pub struct SandboxConfig {
    /// Maximum time the caller waits for a worker to answer
    pub timeout: Duration,
    /// Address-space limit (RLIMIT_AS) in bytes for worker processes.
    /// `None` leaves the inherited limit untouched.
    pub max_memory: Option<u64>,
    /// Run confined code in a worker process instead of the caller's process
    pub use_subprocess: bool,
    /// Keep one worker alive across calls instead of spawning one per call
    pub persistent_worker: bool,
    /// Protections enabled (in order) around every confined run
    pub policies: Vec<Arc<dyn Protection>>,
    /// Idle poll interval of a worker's serving loop
    pub worker_poll_interval: Duration,
    /// Grace period between SIGTERM and SIGKILL
    pub kill_grace: Duration,
    /// Bounded wait for reaping a terminated worker
    pub reap_timeout: Duration,
}

impl Default for SandboxConfig {
    /// Worker-isolated, single-use workers, 5 s timeout, 512 MiB address space
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_memory: Some(DEFAULT_MAX_MEMORY),
            use_subprocess: true,
            persistent_worker: false,
            policies: Vec::new(),
            worker_poll_interval: DEFAULT_WORKER_POLL_INTERVAL,
            kill_grace: DEFAULT_KILL_GRACE,
            reap_timeout: DEFAULT_REAP_TIMEOUT,
        }
    }
}

impl fmt::Debug for SandboxConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxConfig")
            .field("timeout", &self.timeout)
            .field("max_memory", &self.max_memory)
            .field("use_subprocess", &self.use_subprocess)
            .field("persistent_worker", &self.persistent_worker)
            .field("policies", &self.policy_names())
            .field("worker_poll_interval", &self.worker_poll_interval)
            .finish()
    }
}

impl SandboxConfig {
    /// Config that runs everything inside the calling process
    pub fn in_process() -> Self {
        Self {
            use_subprocess: false,
            ..Self::default()
        }
    }

    /// Config that keeps a single long-lived worker
    pub fn persistent() -> Self {
        Self {
            persistent_worker: true,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_memory(mut self, max_memory: Option<u64>) -> Self {
        self.max_memory = max_memory;
        self
    }

    pub fn with_subprocess(mut self, use_subprocess: bool) -> Self {
        self.use_subprocess = use_subprocess;
        self
    }

    pub fn with_persistent_worker(mut self, persistent_worker: bool) -> Self {
        self.persistent_worker = persistent_worker;
        self
    }

    /// Append a protection to the end of the stack
    pub fn with_policy(mut self, policy: impl Protection + 'static) -> Self {
        self.policies.push(Arc::new(policy));
        self
    }

    pub fn with_worker_poll_interval(mut self, interval: Duration) -> Self {
        self.worker_poll_interval = interval;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Names of the configured protections, in enable order
    pub fn policy_names(&self) -> Vec<String> {
        self.policies.iter().map(|p| p.name().to_string()).collect()
    }

    /// Serializable view of this config carried by every task
    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            timeout_ms: self.timeout.as_millis() as u64,
            max_memory: self.max_memory,
            use_subprocess: self.use_subprocess,
            persistent_worker: self.persistent_worker,
            policies: self.policy_names(),
        }
    }

    /// Execution mode selected by this config
    pub fn mode(&self) -> ExecutionMode {
        match (self.use_subprocess, self.persistent_worker) {
            (false, _) => ExecutionMode::InProcess,
            (true, true) => ExecutionMode::PersistentWorker,
            (true, false) => ExecutionMode::SingleUseWorker,
        }
    }

    /// See [`validate_config`](crate::config::validator::validate_config)
    pub fn validate(&self) -> Result<crate::config::validator::ValidationResult> {
        crate::config::validator::validate_config(self)
    }
}

/// Where a confined call runs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    InProcess,
    PersistentWorker,
    SingleUseWorker,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InProcess => "in-process",
            Self::PersistentWorker => "persistent-worker",
            Self::SingleUseWorker => "single-use-worker",
        };
        f.write_str(name)
    }
}

/// Wire form of [`SandboxConfig`]; protections travel by name only
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub timeout_ms: u64,
    pub max_memory: Option<u64>,
    pub use_subprocess: bool,
    pub persistent_worker: bool,
    pub policies: Vec<String>,
}

impl ConfigSnapshot {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Error raised by confined code itself.
///
/// Carries only data (kind and message), so it is rebuilt identically on the
/// caller side whether the code ran in-process or in a worker.
#[derive(Error, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ConfinedError {
    pub kind: String,
    pub message: String,
}

impl ConfinedError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn name_error(name: &str) -> Self {
        Self::new("NameError", format!("name '{}' is not defined", name))
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new("AccessDenied", message)
    }

    pub fn panic(message: impl Into<String>) -> Self {
        Self::new("Panic", message)
    }

    pub fn memory_error(message: impl Into<String>) -> Self {
        Self::new("MemoryError", message)
    }
}

/// Failure reported by a protection's enable or disable hook
#[derive(Error, Clone, Debug, PartialEq, Eq)]
#[error("{0}")]
pub struct ProtectionError(pub String);

impl ProtectionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Custom error types for confine
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The worker did not answer within the configured timeout; it was killed
    #[error("Timeout: no result within {0:?}")]
    Timeout(Duration),

    /// A task or its result could not cross the worker boundary
    #[error("Transmission error: {0}")]
    Transmission(String),

    /// Error raised by the confined code, same shape in every execution mode
    #[error(transparent)]
    Confined(#[from] ConfinedError),

    /// A protection failed to enable or disable
    #[error("Protection '{name}' failed: {message}")]
    Protection { name: String, message: String },

    /// The worker died while a task was in flight (e.g. killed for exceeding its memory cap)
    #[error("Worker {pid} exited while a task was in flight: {status}")]
    WorkerLost { pid: i32, status: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// The content error, if this failure came from confined code
    pub fn as_confined(&self) -> Option<&ConfinedError> {
        match self {
            Self::Confined(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Result type alias for confine operations
pub type Result<T> = std::result::Result<T, SandboxError>;
