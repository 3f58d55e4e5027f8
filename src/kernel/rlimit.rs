use crate::config::types::{Result, SandboxError};

/// Cap the calling process's address space at `bytes`.
///
/// Both the soft and hard limit are lowered, so the cap cannot be raised
/// again by anything running in this process. If the inherited hard limit is
/// already lower, it is kept.
pub fn apply_address_space_limit(bytes: u64) -> Result<u64> {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `current` is a valid out-parameter for getrlimit.
    if unsafe { libc::getrlimit(libc::RLIMIT_AS, &mut current) } != 0 {
        return Err(SandboxError::Process(format!(
            "getrlimit(RLIMIT_AS): {}",
            std::io::Error::last_os_error()
        )));
    }

    let requested = bytes as libc::rlim_t;
    let effective = if current.rlim_max == libc::RLIM_INFINITY {
        requested
    } else {
        requested.min(current.rlim_max)
    };
    let limit = libc::rlimit {
        rlim_cur: effective,
        rlim_max: effective,
    };

    // SAFETY: `limit` is a fully initialised rlimit.
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_AS, &limit) };
    if rc != 0 {
        return Err(SandboxError::Process(format!(
            "Failed to apply RLIMIT_AS={}: {}",
            effective,
            std::io::Error::last_os_error()
        )));
    }
    Ok(effective as u64)
}

/// Current virtual memory size of this process, from `/proc/self/statm`
pub fn current_virtual_size() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().next()?.parse().ok()?;
    // SAFETY: sysconf has no preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    u64::try_from(page_size).ok().map(|size| pages * size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_a_plausible_virtual_size() {
        let size = current_virtual_size().unwrap();
        assert!(size > 1024 * 1024);
    }
}
