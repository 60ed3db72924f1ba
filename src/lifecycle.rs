//! Lifecycle management for the supervisor process.
//!
//! RAII: dropping the handle reaps the supervisor on any exit path (normal
//! return, early return, panic). Shutdown is graceful first, on the
//! assumption that the caller has closed the control pipes and the
//! supervisor exits on its own; past the deadline it escalates to SIGKILL.

use anyhow::{bail, Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::process::{Child as ChildProcess, ExitStatus};
use std::time::{Duration, Instant};

const DROP_GRACE: Duration = Duration::from_secs(1);

pub struct SupervisorHandle {
    process: Option<ChildProcess>,
}

impl SupervisorHandle {
    pub fn new(process: ChildProcess) -> Self {
        Self {
            process: Some(process),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|process| process.id())
    }

    /// Wait up to `timeout` for the supervisor to exit, then SIGKILL it.
    pub fn shutdown(&mut self, timeout: Duration) -> Result<ExitStatus> {
        let Some(mut process) = self.process.take() else {
            bail!("supervisor already reaped");
        };
        let status = reap(&mut process, timeout).context("reap supervisor")?;
        Ok(status)
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        if let Some(mut process) = self.process.take() {
            if reap(&mut process, DROP_GRACE).is_err() {
                eprintln!("[client] Failed to reap supervisor pid {}", process.id());
            }
        }
    }
}

fn reap(process: &mut ChildProcess, timeout: Duration) -> std::io::Result<ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = process.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    let _ = kill(Pid::from_raw(process.id() as i32), Signal::SIGKILL);
    process.wait()
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_shutdown_reaps_exited_process() {
        let process = Command::new("true").spawn().unwrap();
        let mut handle = SupervisorHandle::new(process);
        let status = handle.shutdown(Duration::from_secs(2)).unwrap();
        assert!(status.success());
    }

    #[test]
    fn test_shutdown_escalates_to_sigkill() {
        let process = Command::new("sleep").arg("30").spawn().unwrap();
        let mut handle = SupervisorHandle::new(process);
        let start = Instant::now();
        let status = handle.shutdown(Duration::from_millis(50)).unwrap();
        assert!(!status.success());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_double_shutdown_is_an_error() {
        let process = Command::new("true").spawn().unwrap();
        let mut handle = SupervisorHandle::new(process);
        handle.shutdown(Duration::from_secs(2)).unwrap();
        assert!(handle.shutdown(Duration::from_secs(2)).is_err());
        assert!(handle.pid().is_none());
    }

    #[test]
    fn test_drop_kills_lingering_process() {
        let process = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = process.id() as i32;
        drop(SupervisorHandle::new(process));
        // After drop the pid is gone (or a zombie already reaped by wait)
        assert!(kill(Pid::from_raw(pid), None).is_err());
    }
}
