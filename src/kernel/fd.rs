use crate::config::types::{Result, SandboxError};
use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use std::fs;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

/// Create a pipe whose ends are closed on exec. Returns `(read, write)`.
pub fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let (read, write) = pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| SandboxError::Process(format!("pipe2: {}", e)))?;
    // SAFETY: both descriptors were just created and nothing else owns them.
    Ok(unsafe { (OwnedFd::from_raw_fd(read), OwnedFd::from_raw_fd(write)) })
}

/// Close every descriptor above stderr except those in `keep`.
///
/// Called in a freshly forked worker: it must not hold pipe ends that belong
/// to other workers, or their EOF and hang-up signalling stops working.
pub fn close_inherited_fds(keep: &[RawFd]) -> Result<usize> {
    // Collect first: the directory handle is itself one of the listed fds.
    let open: Vec<RawFd> = fs::read_dir("/proc/self/fd")
        .map_err(|e| SandboxError::Process(format!("read /proc/self/fd: {}", e)))?
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
        .collect();

    let mut closed = 0;
    for fd in open {
        if fd <= 2 || keep.contains(&fd) {
            continue;
        }
        match nix::unistd::close(fd) {
            Ok(()) => closed += 1,
            Err(nix::errno::Errno::EBADF) => {}
            Err(e) => log::warn!("failed to close inherited fd {}: {}", fd, e),
        }
    }
    Ok(closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;

    #[test]
    fn pipe_carries_bytes_and_is_cloexec() {
        let (read, write) = cloexec_pipe().unwrap();
        // SAFETY: querying descriptor flags of an fd we own.
        let flags = unsafe { libc::fcntl(read.as_raw_fd(), libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);

        let mut writer = fs::File::from(write);
        writer.write_all(b"ping").unwrap();
        drop(writer);
        let mut buf = String::new();
        fs::File::from(read).read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "ping");
    }
}
