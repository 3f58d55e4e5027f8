//! Isolated worker processes.
//!
//! A worker is forked from the coordinator, so it inherits the function
//! registry and the protection stack by value. It caps its own address space
//! once, then serves tasks one at a time until its task channel closes or it
//! finds itself orphaned.

use crate::config::types::{ConfinedError, Result, SandboxConfig, SandboxError};
use crate::core::channel::{
    decode_frame, encode_frame, ensure_namespace_transmissible, ensure_transmissible, FrameReader,
    FrameWriter,
};
use crate::core::supervisor::{terminate_worker, wait_for_exit};
use crate::core::types::{KillReport, Task, TaskPayload, TaskResult, WireOutcome, WorkerState};
use crate::exec::confined::{run_call, run_code};
use crate::exec::function::FunctionRegistry;
use crate::kernel::{fd, process, rlimit};
use crate::protection::{panic_message, Site};
use crate::value::Value;
use nix::unistd::Pid;
use std::os::fd::AsRawFd;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Upper bound on one wait for a result; liveness is checked between waits
const RESULT_POLL_SLICE: Duration = Duration::from_millis(50);

/// Exit codes of the serving loop
const EXIT_CHANNEL_CLOSED: i32 = 0;
const EXIT_SETUP_FAILED: i32 = 70;
const EXIT_CHANNEL_BROKEN: i32 = 71;

/// Coordinator-side handle of one worker process
pub struct WorkerHandle {
    pid: Pid,
    tasks: Option<FrameWriter>,
    results: FrameReader,
    state: WorkerState,
    served: u64,
    kill_grace: Duration,
    reap_timeout: Duration,
}

impl WorkerHandle {
    /// Fork a worker serving `config` with the functions in `registry`
    pub fn spawn(config: &SandboxConfig, registry: &FunctionRegistry) -> Result<Self> {
        let (task_read, task_write) = fd::cloexec_pipe()?;
        let (result_read, result_write) = fd::cloexec_pipe()?;
        let owner = process::current_pid();
        let keep = [task_read.as_raw_fd(), result_write.as_raw_fd()];

        let pid = process::fork_child(move || {
            if let Err(e) = fd::close_inherited_fds(&keep) {
                log::warn!("worker could not close inherited fds: {}", e);
            }
            serve(
                config,
                registry,
                owner,
                FrameReader::new(task_read),
                FrameWriter::new(result_write),
            )
        })?;

        log::debug!("spawned worker {}", pid);
        Ok(Self {
            pid,
            tasks: Some(FrameWriter::new(task_write)),
            results: FrameReader::new(result_read),
            state: WorkerState::Idle,
            served: 0,
            kill_grace: config.kill_grace,
            reap_timeout: config.reap_timeout,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Tasks answered by this worker so far
    pub fn served(&self) -> u64 {
        self.served
    }

    /// Check the process is still running, reaping it if it is not
    pub fn is_alive(&mut self) -> bool {
        if self.state == WorkerState::Terminated {
            return false;
        }
        match process::try_reap(self.pid) {
            Ok(None) => true,
            Ok(Some(status)) => {
                log::debug!("worker {} {}", self.pid, status);
                self.state = WorkerState::Terminated;
                false
            }
            Err(_) => {
                self.state = WorkerState::Terminated;
                false
            }
        }
    }

    /// Send one encoded task and wait up to `timeout` for its result.
    ///
    /// The handle stays reusable only if it is `Idle` afterwards. On
    /// `Timeout` it is left `Busy` for the caller to terminate; on
    /// `WorkerLost` it is already `Terminated`.
    pub fn run_task(
        &mut self,
        task: &Task,
        frame: &[u8],
        timeout: Duration,
    ) -> Result<TaskResult> {
        let reap_timeout = self.reap_timeout;
        let writer = self.tasks.as_mut().ok_or_else(|| {
            SandboxError::Process(format!("worker {} is already shutting down", self.pid))
        })?;

        self.state = WorkerState::Busy;
        if let Err(e) = writer.send_frame(frame) {
            return Err(self.lost_or(e, reap_timeout));
        }

        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(SandboxError::Timeout(timeout));
            }

            if self.results.wait_readable(RESULT_POLL_SLICE.min(deadline - now))? {
                return match self.results.recv::<TaskResult>() {
                    Ok(Some(result)) if result.task_id == task.id => {
                        self.state = WorkerState::Idle;
                        self.served += 1;
                        Ok(result)
                    }
                    // The worker could not read the task in flight.
                    Ok(Some(result)) if result.is_unreadable() => {
                        self.state = WorkerState::Idle;
                        self.served += 1;
                        Ok(TaskResult {
                            task_id: task.id,
                            ..result
                        })
                    }
                    Ok(Some(result)) => Err(SandboxError::Transmission(format!(
                        "worker {} answered task {} while {} was in flight",
                        self.pid, result.task_id, task.id
                    ))),
                    Ok(None) => Err(self.lost(reap_timeout)),
                    Err(e) => Err(self.lost_or(e, reap_timeout)),
                };
            }

            if let Ok(Some(status)) = process::try_reap(self.pid) {
                self.state = WorkerState::Terminated;
                return Err(SandboxError::WorkerLost {
                    pid: self.pid.as_raw(),
                    status: status.to_string(),
                });
            }
        }
    }

    /// The worker closed its result channel: collect its exit status
    fn lost(&mut self, reap_timeout: Duration) -> SandboxError {
        let status = match wait_for_exit(self.pid, reap_timeout) {
            Ok(Some(status)) => status.to_string(),
            Ok(None) => {
                let report = self.terminate();
                format!(
                    "closed its result channel, then {}",
                    report.exit_status.as_deref().unwrap_or("could not be reaped")
                )
            }
            Err(e) => format!("unknown ({})", e),
        };
        self.state = WorkerState::Terminated;
        SandboxError::WorkerLost {
            pid: self.pid.as_raw(),
            status,
        }
    }

    /// A channel operation failed: a dead worker explains it, otherwise keep `err`
    fn lost_or(&mut self, err: SandboxError, reap_timeout: Duration) -> SandboxError {
        match wait_for_exit(self.pid, reap_timeout.min(RESULT_POLL_SLICE)) {
            Ok(Some(status)) => {
                self.state = WorkerState::Terminated;
                SandboxError::WorkerLost {
                    pid: self.pid.as_raw(),
                    status: status.to_string(),
                }
            }
            _ => err,
        }
    }

    /// Close the task channel and let the worker exit on its own, escalating
    /// to signals if it has not exited within the kill grace period
    pub fn shutdown(mut self) -> KillReport {
        self.tasks = None;
        if self.state == WorkerState::Terminated {
            return KillReport {
                reaped: true,
                ..KillReport::default()
            };
        }
        match wait_for_exit(self.pid, self.kill_grace) {
            Ok(Some(status)) => {
                self.state = WorkerState::Terminated;
                KillReport {
                    reaped: true,
                    exit_status: Some(status.to_string()),
                    ..KillReport::default()
                }
            }
            Ok(None) => self.kill(),
            Err(e) => {
                self.state = WorkerState::Terminated;
                KillReport {
                    notes: vec![format!("waitpid: {}", e)],
                    ..KillReport::default()
                }
            }
        }
    }

    /// Forcibly terminate the worker
    pub fn kill(mut self) -> KillReport {
        self.terminate()
    }

    fn terminate(&mut self) -> KillReport {
        self.tasks = None;
        let report = terminate_worker(self.pid, self.kill_grace, self.reap_timeout);
        self.state = WorkerState::Terminated;
        report
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.state != WorkerState::Terminated {
            log::debug!("worker {} dropped while {}; terminating", self.pid, self.state);
            self.terminate();
        }
    }
}

/// Serving loop of a forked worker; returns its exit code
fn serve(
    config: &SandboxConfig,
    registry: &FunctionRegistry,
    owner: Pid,
    mut tasks: FrameReader,
    mut results: FrameWriter,
) -> i32 {
    if let Some(bytes) = config.max_memory {
        if let Some(current) = rlimit::current_virtual_size() {
            if current > bytes {
                log::warn!(
                    "worker address space ({} bytes) already exceeds max_memory ({} bytes)",
                    current,
                    bytes
                );
            }
        }
        if let Err(e) = rlimit::apply_address_space_limit(bytes) {
            log::error!("worker could not cap its address space: {}", e);
            return EXIT_SETUP_FAILED;
        }
    }

    let site = Site::Worker {
        pid: std::process::id(),
    };

    loop {
        match tasks.wait_readable(config.worker_poll_interval) {
            Ok(true) => {}
            Ok(false) => {
                if process::parent_pid() != owner {
                    log::warn!("{} orphaned (owner {} is gone); exiting", site, owner);
                    process::kill_self();
                }
                continue;
            }
            Err(e) => {
                log::error!("worker poll failed: {}", e);
                return EXIT_CHANNEL_BROKEN;
            }
        }

        let body = match tasks.recv_frame() {
            Ok(Some(body)) => body,
            Ok(None) => return EXIT_CHANNEL_CLOSED,
            Err(e) => {
                log::error!("worker could not read task: {}", e);
                return EXIT_CHANNEL_BROKEN;
            }
        };

        // A body that does not decode still ends on a frame boundary, so the
        // worker answers it and keeps serving.
        let (task_id, result) = match decode_frame::<Task>(&body) {
            Ok(task) => {
                let task_id = task.id;
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    process_task(config, registry, site, task)
                }))
                .unwrap_or_else(|payload| TaskResult {
                    task_id,
                    outcome: WireOutcome::Confined {
                        error: ConfinedError::panic(panic_message(payload.as_ref())),
                    },
                    globals: None,
                    locals: None,
                });
                (task_id, result)
            }
            Err(e) => {
                log::warn!("{} could not decode a task: {}", site, e);
                (Uuid::nil(), TaskResult::unreadable(e.to_string()))
            }
        };

        let frame = encode_frame(&result).or_else(|e| {
            encode_frame(&TaskResult {
                task_id,
                outcome: WireOutcome::Rejected {
                    reason: format!("result could not be transmitted: {}", e),
                },
                globals: None,
                locals: None,
            })
        });
        let sent = match frame {
            Ok(frame) => results.send_frame(&frame),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            log::error!("worker could not send result: {}", e);
            return EXIT_CHANNEL_BROKEN;
        }
    }
}

/// Run one task on the same guarded path used in-process
pub(crate) fn process_task(
    config: &SandboxConfig,
    registry: &FunctionRegistry,
    site: Site,
    task: Task,
) -> TaskResult {
    let task_id = task.id;
    let rejected = |reason: String| TaskResult {
        task_id,
        outcome: WireOutcome::Rejected { reason },
        globals: None,
        locals: None,
    };

    let expected = config.policy_names();
    if task.config.policies != expected {
        return rejected(format!(
            "protection stack mismatch: task expects {:?}, worker runs {:?}",
            task.config.policies, expected
        ));
    }

    match task.payload {
        TaskPayload::Call { function, args } => {
            let Some(target) = registry.get(&function) else {
                return rejected(format!("function '{}' is not registered with this worker", function));
            };
            let outcome = WireOutcome::from_result(run_call(config, site, target, &args));
            if let WireOutcome::Success { value } = &outcome {
                if let Err(reason) = ensure_transmissible(value) {
                    return rejected(format!("return value of '{}': {}", function, reason));
                }
            }
            TaskResult {
                task_id,
                outcome,
                globals: None,
                locals: None,
            }
        }
        TaskPayload::Execute {
            code,
            mut globals,
            mut locals,
        } => {
            let result = run_code(config, site, registry, &code, &mut globals, locals.as_mut());
            let outcome = WireOutcome::from_result(result.map(|()| Value::None));
            let transmissible = ensure_namespace_transmissible(&globals).and_then(|()| {
                locals
                    .as_ref()
                    .map_or(Ok(()), ensure_namespace_transmissible)
            });
            if let Err(reason) = transmissible {
                return rejected(format!("namespace after execution: {}", reason));
            }
            TaskResult {
                task_id,
                outcome,
                globals: Some(globals),
                locals,
            }
        }
    }
}
