use crate::config::types::{Result, SandboxError};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// How a child process ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitDescription {
    Exited(i32),
    Signaled(i32),
}

impl fmt::Display for ExitDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitDescription::Exited(code) => write!(f, "exited with code {}", code),
            ExitDescription::Signaled(signal) => {
                let name = Signal::try_from(*signal)
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_else(|_| format!("signal {}", signal));
                write!(f, "killed by {}", name)
            }
        }
    }
}

/// Fork a child that runs `child_main` and exits with its return code.
///
/// The child never returns into the caller's stack: it leaves through
/// `_exit`, skipping atexit handlers and destructors owned by the parent.
/// A panic escaping `child_main` exits with code 101.
pub fn fork_child(child_main: impl FnOnce() -> i32) -> Result<Pid> {
    // SAFETY: the child only runs `child_main` and then calls `_exit`; it
    // never returns to code that assumes it is the original process.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => Ok(child),
        Ok(ForkResult::Child) => {
            let code = panic::catch_unwind(AssertUnwindSafe(child_main)).unwrap_or(101);
            // SAFETY: _exit is async-signal-safe and terminates immediately.
            unsafe { libc::_exit(code) }
        }
        Err(e) => Err(SandboxError::Process(format!("fork(worker): {}", e))),
    }
}

/// Reap `pid` if it has terminated, without blocking.
///
/// `Ok(None)` means still running. A pid that is not (or no longer) our
/// child is reported as `ECHILD`.
pub fn try_reap(pid: Pid) -> std::result::Result<Option<ExitDescription>, Errno> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => return Ok(None),
            Ok(WaitStatus::Exited(_, code)) => return Ok(Some(ExitDescription::Exited(code))),
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                return Ok(Some(ExitDescription::Signaled(signal as i32)))
            }
            Ok(_) => return Ok(None),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Deliver `signal` to `pid`; `false` if the process no longer exists
pub fn send_signal(pid: Pid, signal: Signal) -> bool {
    match kill(pid, signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            log::warn!("kill({}, {}) failed: {}", pid, signal, e);
            false
        }
    }
}

/// Parent of the calling process
pub fn parent_pid() -> Pid {
    nix::unistd::getppid()
}

pub fn current_pid() -> Pid {
    nix::unistd::getpid()
}

/// Kill the calling process with SIGKILL. Used by orphaned workers.
pub fn kill_self() -> ! {
    let _ = kill(current_pid(), Signal::SIGKILL);
    // SAFETY: _exit is async-signal-safe; reached only if SIGKILL was refused.
    unsafe { libc::_exit(137) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn reap_within(pid: Pid, limit: Duration) -> Option<ExitDescription> {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if let Some(status) = try_reap(pid).unwrap() {
                return Some(status);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn child_exit_code_is_observed() {
        let pid = fork_child(|| 7).unwrap();
        assert_eq!(
            reap_within(pid, Duration::from_secs(5)),
            Some(ExitDescription::Exited(7))
        );
    }

    #[test]
    fn killed_child_reports_signal() {
        let pid = fork_child(|| {
            std::thread::sleep(Duration::from_secs(30));
            0
        })
        .unwrap();
        assert!(send_signal(pid, Signal::SIGKILL));
        let status = reap_within(pid, Duration::from_secs(5)).unwrap();
        assert_eq!(status, ExitDescription::Signaled(libc::SIGKILL));
        assert_eq!(status.to_string(), "killed by SIGKILL");
    }
}
