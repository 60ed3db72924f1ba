//! Poll-set plumbing shared by the supervisor and controller loops.
//!
//! Both loops are single-threaded: every fd is non-blocking and suspension
//! happens only inside `poll`. The set holds raw fds; ownership of the fds
//! stays with the caller.

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::os::fd::{BorrowedFd, RawFd};

/// Events that mean an fd is no longer usable.
pub fn error_events() -> PollFlags {
    PollFlags::POLLERR | PollFlags::POLLNVAL | PollFlags::POLLHUP
}

#[derive(Debug, Default)]
pub struct PollSet {
    entries: Vec<(RawFd, PollFlags)>,
}

impl PollSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `fd` for `flags`, replacing any previous registration.
    pub fn register(&mut self, fd: RawFd, flags: PollFlags) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.0 == fd) {
            entry.1 = flags;
        } else {
            self.entries.push((fd, flags));
        }
    }

    pub fn unregister(&mut self, fd: RawFd) {
        self.entries.retain(|entry| entry.0 != fd);
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.entries.iter().any(|entry| entry.0 == fd)
    }

    /// Poll every registered fd, returning `(fd, revents)` for each one that
    /// has events. EINTR is surfaced to the caller so it can check shutdown
    /// flags before retrying.
    pub fn wait(&self, timeout: PollTimeout) -> nix::Result<Vec<(RawFd, PollFlags)>> {
        let mut fds: Vec<PollFd> = self
            .entries
            .iter()
            .map(|&(fd, flags)| PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, flags))
            .collect();
        poll(&mut fds, timeout)?;
        Ok(self
            .entries
            .iter()
            .zip(fds.iter())
            .filter_map(|(&(fd, _), pollfd)| {
                let revents = pollfd.revents().unwrap_or(PollFlags::empty());
                if revents.is_empty() {
                    None
                } else {
                    Some((fd, revents))
                }
            })
            .collect())
    }
}

// =============================================================================
// Raw fd helpers
// =============================================================================

pub fn set_nonblocking(fd: RawFd, on: bool) -> std::io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let flags = if on {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if libc::fcntl(fd, libc::F_SETFL, flags) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

pub fn set_cloexec(fd: RawFd, on: bool) -> std::io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let flags = if on {
            flags | libc::FD_CLOEXEC
        } else {
            flags & !libc::FD_CLOEXEC
        };
        if libc::fcntl(fd, libc::F_SETFD, flags) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Read once from a raw fd. EAGAIN/EINTR surface as io::ErrorKind
/// WouldBlock/Interrupted for callers to dispatch on.
pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> std::io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Write once to a raw fd, returning the number of bytes accepted.
pub fn write_fd(fd: RawFd, buf: &[u8]) -> std::io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_pipe_events_roundtrip() {
        let (r, w) = pipe().unwrap();
        let mut set = PollSet::new();
        set.register(r.as_raw_fd(), PollFlags::POLLIN);
        set.register(w.as_raw_fd(), PollFlags::POLLOUT);

        // Empty pipe: only the write end is ready
        let ready = set.wait(PollTimeout::ZERO).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, w.as_raw_fd());
        assert!(ready[0].1.contains(PollFlags::POLLOUT));

        write_fd(w.as_raw_fd(), b"x").unwrap();
        let ready = set.wait(PollTimeout::ZERO).unwrap();
        assert!(ready
            .iter()
            .any(|&(fd, ev)| fd == r.as_raw_fd() && ev.contains(PollFlags::POLLIN)));
    }

    #[test]
    fn test_hangup_reported_on_read_end() {
        let (r, w) = pipe().unwrap();
        let mut set = PollSet::new();
        set.register(r.as_raw_fd(), PollFlags::POLLIN);
        drop(w);
        let ready = set.wait(PollTimeout::ZERO).unwrap();
        assert_eq!(ready.len(), 1);
        assert!(ready[0].1.contains(PollFlags::POLLHUP));
    }

    #[test]
    fn test_register_is_idempotent() {
        let (r, _w) = pipe().unwrap();
        let mut set = PollSet::new();
        set.register(r.as_raw_fd(), PollFlags::POLLIN);
        set.register(r.as_raw_fd(), PollFlags::POLLIN | PollFlags::POLLOUT);
        assert!(set.is_registered(r.as_raw_fd()));
        set.unregister(r.as_raw_fd());
        assert!(!set.is_registered(r.as_raw_fd()));
    }

    #[test]
    fn test_nonblocking_read_returns_would_block() {
        let (r, _w) = pipe().unwrap();
        set_nonblocking(r.as_raw_fd(), true).unwrap();
        let mut buf = [0u8; 4];
        let err = read_fd(r.as_raw_fd(), &mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }
}
