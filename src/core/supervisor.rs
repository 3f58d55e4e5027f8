use crate::core::types::KillReport;
use crate::kernel::process::{send_signal, try_reap, ExitDescription};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::time::{Duration, Instant};

const REAP_POLL: Duration = Duration::from_millis(5);

/// Wait up to `limit` for `pid` to terminate and reap it.
///
/// `Ok(None)` if it is still running at the deadline; `Err(ECHILD)` if it
/// was already reaped elsewhere.
pub fn wait_for_exit(pid: Pid, limit: Duration) -> Result<Option<ExitDescription>, Errno> {
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = try_reap(pid)? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        std::thread::sleep(REAP_POLL.min(deadline - now));
    }
}

/// SIGTERM, wait `grace`, SIGKILL, then reap within `reap_timeout`.
pub fn terminate_worker(pid: Pid, grace: Duration, reap_timeout: Duration) -> KillReport {
    let mut report = KillReport::default();
    let start = Instant::now();

    report.term_sent = send_signal(pid, Signal::SIGTERM);
    if !report.term_sent {
        report.notes.push("SIGTERM not delivered: process already gone".to_string());
    }

    if record_exit(&mut report, wait_for_exit(pid, grace)) {
        report.waited_ms = start.elapsed().as_millis() as u64;
        return report;
    }

    report.kill_sent = send_signal(pid, Signal::SIGKILL);
    if !record_exit(&mut report, wait_for_exit(pid, reap_timeout)) {
        report
            .notes
            .push(format!("worker {} not reaped within {:?}", pid, reap_timeout));
        log::warn!("worker {} was not reaped within {:?}", pid, reap_timeout);
    }

    report.waited_ms = start.elapsed().as_millis() as u64;
    report
}

/// Fold a wait outcome into `report`; `true` once nothing is left to wait for
fn record_exit(report: &mut KillReport, outcome: Result<Option<ExitDescription>, Errno>) -> bool {
    match outcome {
        Ok(Some(status)) => {
            report.reaped = true;
            report.exit_status = Some(status.to_string());
            true
        }
        Ok(None) => false,
        Err(e) => {
            report.notes.push(format!("waitpid: {}", e));
            true
        }
    }
}
