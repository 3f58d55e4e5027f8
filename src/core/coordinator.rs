//! Top-level entry point: decides where a confined call runs and owns the
//! lifecycle of the worker that runs it.

use crate::config::types::{ConfinedError, ExecutionMode, Result, SandboxConfig, SandboxError};
use crate::core::channel::{encode_frame, ensure_args_transmissible, ensure_namespace_transmissible};
use crate::core::types::{KillReport, Task, TaskPayload, TaskResult, WireOutcome, WorkerState};
use crate::core::worker::WorkerHandle;
use crate::exec::confined::{run_call, run_code};
use crate::exec::function::{Args, Function, FunctionRegistry};
use crate::exec::script::Code;
use crate::observability::audit::{AuditLog, LifecycleEvent, LifecycleEventType};
use crate::protection::Site;
use crate::value::{Namespace, Value};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Runs functions and code blocks under a [`SandboxConfig`].
///
/// In-process mode runs everything on the calling thread. Worker modes fork
/// an isolated process from this one, so only functions in the coordinator's
/// [`FunctionRegistry`] can be called there. A persistent worker is reused
/// across calls until it times out, dies, or the coordinator is closed.
pub struct ExecutionCoordinator {
    id: Uuid,
    config: SandboxConfig,
    registry: FunctionRegistry,
    worker: Mutex<Option<WorkerHandle>>,
    audit: AuditLog,
}

impl ExecutionCoordinator {
    pub fn new(config: SandboxConfig) -> Result<Self> {
        Self::with_registry(config, FunctionRegistry::new())
    }

    /// Validate `config` and build a coordinator that ships `registry` to its workers
    pub fn with_registry(config: SandboxConfig, registry: FunctionRegistry) -> Result<Self> {
        config.validate()?;
        let id = Uuid::new_v4();
        log::info!(
            "coordinator {} ready: mode={}, timeout={:?}, functions={}",
            id,
            config.mode(),
            config.timeout,
            registry.len()
        );
        Ok(Self {
            id,
            config,
            registry,
            worker: Mutex::new(None),
            audit: AuditLog::new(id),
        })
    }

    /// Keep lifecycle events in memory as well as logging them
    pub fn record_audit(mut self) -> Self {
        self.audit = AuditLog::recording(self.id);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn mode(&self) -> ExecutionMode {
        self.config.mode()
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Make `function` callable in workers.
    ///
    /// A running persistent worker was forked with the old registry, so it is
    /// retired; the next call spawns one that knows `function`.
    pub fn register(&mut self, function: Function) -> Option<Function> {
        let previous = self.registry.register(function);
        if self.close().is_some() {
            log::debug!(
                "coordinator {}: retired worker after registering '{}'",
                self.id,
                function.name()
            );
        }
        previous
    }

    /// Pid of the live persistent worker, if one is running
    pub fn worker_pid(&self) -> Option<i32> {
        let mut slot = self.lock_worker();
        let worker = slot.as_mut()?;
        worker.is_alive().then(|| worker.pid().as_raw())
    }

    /// Call `function` with `args` under confinement.
    ///
    /// Content errors come back as [`SandboxError::Confined`] with the same
    /// kind and message in every mode.
    pub fn call(&self, function: &Function, args: &Args) -> Result<Value> {
        if self.config.mode() == ExecutionMode::InProcess {
            return run_call(&self.config, Site::InProcess, function, args);
        }

        if !self.registry.contains(function.name()) {
            return Err(self.transmission_failure(
                None,
                format!(
                    "function '{}' is not registered with this coordinator",
                    function.name()
                ),
            ));
        }
        if let Err(reason) = ensure_args_transmissible(args) {
            return Err(self.transmission_failure(
                None,
                format!("arguments of '{}': {}", function.name(), reason),
            ));
        }

        let task = Task::new(
            self.config.snapshot(),
            TaskPayload::Call {
                function: function.name().to_string(),
                args: args.clone(),
            },
        );
        let result = self.dispatch(task)?;
        self.finish(result)
    }

    /// Call a registered function by name
    pub fn call_registered(&self, name: &str, args: &Args) -> Result<Value> {
        let function = *self
            .registry
            .get(name)
            .ok_or_else(|| ConfinedError::name_error(name))?;
        self.call(&function, args)
    }

    /// Run `code` against `globals` and `locals`, updating them in place.
    ///
    /// `globals = None` runs against a fresh namespace that is discarded
    /// afterwards; `locals = None` makes the globals serve as locals. In
    /// worker modes the namespaces are copied out and merged back into the
    /// same objects, also when the code fails partway.
    pub fn execute(
        &self,
        code: &Code,
        globals: Option<&mut Namespace>,
        locals: Option<&mut Namespace>,
    ) -> Result<()> {
        let mut scratch = Namespace::new();
        let globals = globals.unwrap_or(&mut scratch);

        if self.config.mode() == ExecutionMode::InProcess {
            return run_code(
                &self.config,
                Site::InProcess,
                &self.registry,
                code,
                globals,
                locals,
            );
        }

        let transmissible = ensure_namespace_transmissible(globals).and_then(|()| {
            locals
                .as_deref()
                .map_or(Ok(()), ensure_namespace_transmissible)
        });
        if let Err(reason) = transmissible {
            return Err(self.transmission_failure(None, format!("namespace: {}", reason)));
        }

        let task = Task::new(
            self.config.snapshot(),
            TaskPayload::Execute {
                code: code.clone(),
                globals: globals.clone(),
                locals: locals.as_deref().cloned(),
            },
        );
        let mut result = self.dispatch(task)?;

        if let Some(snapshot) = result.globals.take() {
            globals.merge_from(snapshot);
        }
        if let (Some(locals), Some(snapshot)) = (locals, result.locals.take()) {
            locals.merge_from(snapshot);
        }
        self.finish(result).map(|_| ())
    }

    /// Bind `function` and `args` into a zero-argument callable
    pub fn create_callback(&self, function: Function, args: Args) -> Callback<'_> {
        Callback {
            coordinator: self,
            function,
            args,
        }
    }

    /// Release the persistent worker, if any.
    ///
    /// The worker's task channel is closed first so an idle worker exits on
    /// its own; one that does not is killed and reaped with a bounded wait.
    /// The coordinator stays usable and spawns a new worker on demand.
    pub fn close(&self) -> Option<KillReport> {
        let worker = self.lock_worker().take()?;
        let pid = worker.pid().as_raw();
        let report = worker.shutdown();
        self.audit.emit(
            LifecycleEvent::new(
                LifecycleEventType::CoordinatorClosed,
                format!(
                    "worker released: {}",
                    report.exit_status.as_deref().unwrap_or("exit status unknown")
                ),
            )
            .with_worker_pid(pid),
        );
        if report.kill_sent {
            self.audit.emit(
                LifecycleEvent::new(LifecycleEventType::ForcedKill, "worker ignored channel close")
                    .with_worker_pid(pid),
            );
        }
        Some(report)
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<WorkerHandle>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transmission_failure(&self, pid: Option<i32>, reason: String) -> SandboxError {
        let mut event = LifecycleEvent::new(LifecycleEventType::TransmissionFailure, reason.clone());
        if let Some(pid) = pid {
            event = event.with_worker_pid(pid);
        }
        self.audit.emit(event);
        SandboxError::Transmission(reason)
    }

    /// Turn a worker's answer into the caller's result
    fn finish(&self, result: TaskResult) -> Result<Value> {
        if let WireOutcome::Rejected { reason } = &result.outcome {
            self.audit.emit(
                LifecycleEvent::new(LifecycleEventType::TransmissionFailure, reason.clone())
                    .with_task_id(result.task_id),
            );
        }
        result.outcome.into_result()
    }

    /// Run `task` on a worker appropriate to the configured mode
    fn dispatch(&self, task: Task) -> Result<TaskResult> {
        let frame = encode_frame(&task)
            .map_err(|e| self.transmission_failure(None, e.to_string()))?;

        if !self.config.persistent_worker {
            let worker = self.spawn_worker()?;
            let (outcome, worker) = self.run_on(worker, &task, &frame);
            if let Some(worker) = worker {
                let pid = worker.pid().as_raw();
                let report = worker.shutdown();
                self.reaped(pid, &report);
            }
            return outcome;
        }

        // The slot stays locked for the whole task: one task per worker.
        let mut slot = self.lock_worker();
        let current = slot.take().map(|mut worker| {
            let alive = worker.is_alive();
            (worker, alive)
        });
        let worker = match current {
            Some((worker, true)) => {
                self.audit.emit(
                    LifecycleEvent::new(LifecycleEventType::WorkerReused, "reusing persistent worker")
                        .with_worker_pid(worker.pid().as_raw())
                        .with_task_id(task.id),
                );
                worker
            }
            Some((dead, false)) => {
                let pid = dead.pid().as_raw();
                drop(dead);
                let worker = self.spawn_worker()?;
                self.audit.emit(
                    LifecycleEvent::new(
                        LifecycleEventType::WorkerReplaced,
                        format!("worker {} died while idle; replaced by {}", pid, worker.pid()),
                    )
                    .with_worker_pid(worker.pid().as_raw()),
                );
                worker
            }
            None => self.spawn_worker()?,
        };

        let (outcome, worker) = self.run_on(worker, &task, &frame);
        *slot = worker;
        outcome
    }

    /// Run one task, returning the worker only if it can serve another
    fn run_on(
        &self,
        mut worker: WorkerHandle,
        task: &Task,
        frame: &[u8],
    ) -> (Result<TaskResult>, Option<WorkerHandle>) {
        let pid = worker.pid().as_raw();
        let outcome = worker.run_task(task, frame, self.config.timeout);

        match &outcome {
            Err(SandboxError::Timeout(limit)) => {
                log::warn!(
                    "coordinator {}: task {} ({}) timed out after {:?} on worker {}",
                    self.id,
                    task.id,
                    task.payload.label(),
                    limit,
                    pid
                );
                self.audit.emit(
                    LifecycleEvent::new(
                        LifecycleEventType::TaskTimeout,
                        format!("no result within {:?}", limit),
                    )
                    .with_worker_pid(pid)
                    .with_task_id(task.id),
                );
            }
            Err(SandboxError::WorkerLost { status, .. }) => {
                log::warn!("coordinator {}: worker {} lost: {}", self.id, pid, status);
                self.audit.emit(
                    LifecycleEvent::new(LifecycleEventType::WorkerLost, status.clone())
                        .with_worker_pid(pid)
                        .with_task_id(task.id),
                );
            }
            Err(SandboxError::Transmission(reason)) => {
                self.audit.emit(
                    LifecycleEvent::new(LifecycleEventType::TransmissionFailure, reason.clone())
                        .with_worker_pid(pid)
                        .with_task_id(task.id),
                );
            }
            _ => {}
        }

        match worker.state() {
            WorkerState::Idle => (outcome, Some(worker)),
            WorkerState::Terminated => (outcome, None),
            WorkerState::Busy => {
                let report = worker.kill();
                self.audit.emit(
                    LifecycleEvent::new(
                        LifecycleEventType::ForcedKill,
                        format!(
                            "worker discarded mid-task: {}",
                            report.exit_status.as_deref().unwrap_or("not reaped")
                        ),
                    )
                    .with_worker_pid(pid)
                    .with_task_id(task.id),
                );
                (outcome, None)
            }
        }
    }

    fn spawn_worker(&self) -> Result<WorkerHandle> {
        let worker = WorkerHandle::spawn(&self.config, &self.registry)?;
        self.audit.emit(
            LifecycleEvent::new(
                LifecycleEventType::WorkerSpawned,
                format!("{} worker", self.config.mode()),
            )
            .with_worker_pid(worker.pid().as_raw()),
        );
        Ok(worker)
    }

    fn reaped(&self, pid: i32, report: &KillReport) {
        self.audit.emit(
            LifecycleEvent::new(
                LifecycleEventType::WorkerReaped,
                report
                    .exit_status
                    .clone()
                    .unwrap_or_else(|| "exit status unknown".to_string()),
            )
            .with_worker_pid(pid),
        );
    }
}

impl Drop for ExecutionCoordinator {
    fn drop(&mut self) {
        self.close();
    }
}

/// A call bound to its coordinator, function and arguments
pub struct Callback<'c> {
    coordinator: &'c ExecutionCoordinator,
    function: Function,
    args: Args,
}

impl Callback<'_> {
    pub fn invoke(&self) -> Result<Value> {
        self.coordinator.call(&self.function, &self.args)
    }

    pub fn function(&self) -> &Function {
        &self.function
    }
}
