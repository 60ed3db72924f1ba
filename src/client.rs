//! Controller-side client: spawns the supervisor and drives the protocol.
//!
//! The client is not thread-safe; the caller serialises. Every operation is
//! bounded: writes drain under POLLOUT within two seconds, and a fork waits
//! at most two seconds for its `CHILD:`/`ERR:` reply. The supervisor itself
//! has no timeouts of its own; it is purely reactive.

use crate::config::{self, PrewarmConfig};
use crate::errors::PrewarmError;
use crate::lifecycle::SupervisorHandle;
use crate::poller::{self, error_events};
use crate::protocol::{self, ForkRequest, LineBuffer, Reply};
use crate::shm::{SharedMemory, SIZE_PREFIX_BYTES};
use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, signal, SigHandler, Signal};
use nix::unistd::{pipe, Pid};
use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

/// Budget for every bounded client operation.
pub const IO_TIMEOUT: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 8192;

/// A forked child as the controller sees it: just enough to match death
/// notifications and to release the readiness gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Child {
    pub child_id: u64,
    pub pid: i32,
}

pub struct Client {
    // Field order matters on drop: the pipes close first so an un-shutdown
    // supervisor sees EOF and exits before the handle's grace period ends.
    to_supervisor: OwnedFd,
    from_supervisor: OwnedFd,
    death_read: OwnedFd,
    replies: LineBuffer,
    death_lines: LineBuffer,
    children: HashMap<u64, Child>,
    supervisor: SupervisorHandle,
}

impl Client {
    /// Spawn the supervisor from this executable's `supervise` subcommand.
    pub fn spawn(config: &PrewarmConfig) -> Result<Self> {
        let exe = std::env::current_exe().context("resolve current executable")?;
        Self::spawn_exe(&exe, config)
    }

    /// Spawn the supervisor from an explicit binary.
    ///
    /// The supervisor inherits exactly one extra fd, the write end of the
    /// death channel, whose number is passed in its arguments. It starts in
    /// a new session with the config envelope in its environment.
    pub fn spawn_exe(exe: &Path, config: &PrewarmConfig) -> Result<Self> {
        let (death_read, death_write) = pipe().context("death channel pipe")?;
        poller::set_cloexec(death_read.as_raw_fd(), true).context("death channel flags")?;

        let mut command = Command::new(exe);
        command
            .arg("supervise")
            .arg("--notify-fd")
            .arg(death_write.as_raw_fd().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .env(config::CONFIG_ENV_VAR, config.to_json()?);
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let mut process = command
            .spawn()
            .with_context(|| format!("spawn supervisor {}", exe.display()))?;
        drop(death_write);

        let to_supervisor: OwnedFd = process
            .stdin
            .take()
            .context("supervisor stdin missing")?
            .into();
        let from_supervisor: OwnedFd = process
            .stdout
            .take()
            .context("supervisor stdout missing")?
            .into();
        poller::set_nonblocking(to_supervisor.as_raw_fd(), true).context("control pipe flags")?;
        poller::set_nonblocking(from_supervisor.as_raw_fd(), true).context("control pipe flags")?;
        poller::set_nonblocking(death_read.as_raw_fd(), true).context("death channel flags")?;

        // A vanished supervisor must surface as PipeBroken, not kill us.
        unsafe {
            let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
        }

        eprintln!("[client] Supervisor pid {}", process.id());
        Ok(Self {
            to_supervisor,
            from_supervisor,
            death_read,
            replies: LineBuffer::new(),
            death_lines: LineBuffer::new(),
            children: HashMap::new(),
            supervisor: SupervisorHandle::new(process),
        })
    }

    pub fn supervisor_pid(&self) -> Option<u32> {
        self.supervisor.pid()
    }

    /// Number of children tracked locally (forked, not yet seen dying).
    pub fn tracked_children(&self) -> usize {
        self.children.len()
    }

    /// Request one fork. The request plus optional stdin bytes travel
    /// through a freshly allocated shared-memory region; on `CHILD:` the
    /// region becomes the child's and our unlink guard stands down.
    pub fn fork(&mut self, request: &ForkRequest, stdin_data: Option<&[u8]>) -> Result<Child> {
        let stdin_data = stdin_data.unwrap_or_default();
        let mut request = request.clone();
        request.stdin_size = stdin_data.len();
        let payload = serde_json::to_vec(&request).context("encode fork request")?;

        let mut region =
            SharedMemory::create(SIZE_PREFIX_BYTES + payload.len() + stdin_data.len())?;
        region.write_data_with_size(&payload)?;
        if !stdin_data.is_empty() {
            region.write(stdin_data)?;
        }
        self.send(format!("{}:{}\n", protocol::CMD_FORK, region.name()).as_bytes())?;

        let deadline = Instant::now() + IO_TIMEOUT;
        loop {
            while let Some(line) = self.replies.next_line() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        eprintln!("[client] {err}");
                        continue;
                    }
                };
                match protocol::parse_reply(&line) {
                    Reply::Child { child_id, pid } => {
                        region.set_unlink_on_drop(false);
                        let child = Child { child_id, pid };
                        self.children.insert(child_id, child);
                        return Ok(child);
                    }
                    Reply::Err { message } => {
                        return Err(PrewarmError::ForkRejected(message).into())
                    }
                    Reply::Other(other) => {
                        eprintln!("[client] Ignoring stray reply: {other:?}")
                    }
                }
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(PrewarmError::ForkTimedOut.into());
            };
            self.fill_replies(remaining)?;
        }
    }

    /// Release the child's readiness gate. Returns false if the child is
    /// not (or no longer) tracked; the frame is then not sent, so a repeat
    /// release is a local no-op.
    pub fn mark_child_ready(&mut self, child_id: u64) -> Result<bool> {
        if self.children.remove(&child_id).is_none() {
            return Ok(false);
        }
        self.send(format!("{}:{child_id}\n", protocol::CMD_READY).as_bytes())?;
        Ok(true)
    }

    /// Push a new configuration to the supervisor. Children forked after
    /// this see the new options.
    pub fn reload_config(&mut self, config: &PrewarmConfig) -> Result<()> {
        self.send(format!("{}:{}\n", protocol::CMD_RELOAD_CONFIG, config.to_json()?).as_bytes())
    }

    /// Liveness probe: round-trips `text` through the supervisor.
    pub fn echo(&mut self, text: &str) -> Result<String> {
        self.send(format!("{}:{text}\n", protocol::CMD_ECHO).as_bytes())?;
        let deadline = Instant::now() + IO_TIMEOUT;
        loop {
            if let Some(line) = self.replies.next_line() {
                return Ok(line?);
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                bail!("timed out waiting for echo reply");
            };
            self.fill_replies(remaining)?;
        }
    }

    /// Cancel a child by killing its pid; the supervisor notices the
    /// ensuing hang-up and reports the death on the channel. Returns false
    /// for untracked ids.
    pub fn kill_child(&mut self, child_id: u64) -> Result<bool> {
        let Some(child) = self.children.get(&child_id) else {
            return Ok(false);
        };
        kill(Pid::from_raw(child.pid), Signal::SIGTERM)
            .with_context(|| format!("kill child pid {}", child.pid))?;
        Ok(true)
    }

    /// Drain the death channel without blocking. Each returned pid is one
    /// exited child; matching records leave the local table, so a later
    /// `mark_child_ready` for them returns false.
    pub fn dead_children(&mut self) -> Result<Vec<i32>> {
        loop {
            let mut buf = [0u8; READ_CHUNK];
            match poller::read_fd(self.death_read.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(n) => self.death_lines.extend(&buf[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err).context("read death channel"),
            }
        }
        let mut pids = Vec::new();
        while let Some(line) = self.death_lines.next_line() {
            match line {
                Ok(line) => match line.trim().parse::<i32>() {
                    Ok(pid) => pids.push(pid),
                    Err(_) => eprintln!("[client] Bad death notification: {line:?}"),
                },
                Err(err) => eprintln!("[client] {err}"),
            }
        }
        if !pids.is_empty() {
            self.children.retain(|_, child| !pids.contains(&child.pid));
        }
        Ok(pids)
    }

    /// The death channel's read end, for integration into a caller's own
    /// poll loop.
    pub fn death_channel_fd(&self) -> BorrowedFd<'_> {
        self.death_read.as_fd()
    }

    /// Close the control pipes and wait for the supervisor to exit on its
    /// own; a clean supervisor exits 0 within one poll cycle of the EOF.
    pub fn shutdown(self) -> Result<ExitStatus> {
        let Client {
            to_supervisor,
            from_supervisor,
            death_read,
            mut supervisor,
            ..
        } = self;
        drop(to_supervisor);
        let status = supervisor.shutdown(IO_TIMEOUT)?;
        drop(from_supervisor);
        drop(death_read);
        Ok(status)
    }

    // =========================================================================
    // Bounded I/O
    // =========================================================================

    /// Write a frame within the I/O budget, draining partial writes under
    /// POLLOUT. Mirrors the supervisor's own buffered output handling.
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        let mut buf = frame;
        let deadline = Instant::now() + IO_TIMEOUT;
        while !buf.is_empty() {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(PrewarmError::WriteTimedOut.into());
            };
            let mut fds = [PollFd::new(self.to_supervisor.as_fd(), PollFlags::POLLOUT)];
            match poll(&mut fds, poll_timeout(remaining)) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno).context("poll supervisor write fd"),
            }
            let revents = fds[0].revents().unwrap_or(PollFlags::empty());
            if revents.intersects(error_events()) {
                return Err(PrewarmError::PipeBroken.into());
            }
            if revents.contains(PollFlags::POLLOUT) {
                match poller::write_fd(self.to_supervisor.as_raw_fd(), buf) {
                    Ok(n) => buf = &buf[n..],
                    Err(err)
                        if matches!(
                            err.kind(),
                            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
                        ) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                        return Err(PrewarmError::PipeBroken.into());
                    }
                    Err(err) => return Err(err).context("write to supervisor"),
                }
            }
        }
        Ok(())
    }

    /// Read whatever reply bytes arrive within `timeout` into the line
    /// buffer. Returns without error on a quiet pipe; broken pipes fail.
    fn fill_replies(&mut self, timeout: Duration) -> Result<()> {
        let mut fds = [PollFd::new(self.from_supervisor.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, poll_timeout(timeout)) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(()),
            Err(errno) => return Err(errno).context("poll supervisor reply fd"),
        }
        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
            return Err(PrewarmError::PipeBroken.into());
        }
        if revents.contains(PollFlags::POLLIN) {
            let mut buf = [0u8; READ_CHUNK];
            match poller::read_fd(self.from_supervisor.as_raw_fd(), &mut buf) {
                Ok(0) => return Err(PrewarmError::PipeBroken.into()),
                Ok(n) => self.replies.extend(&buf[..n]),
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
                    ) => {}
                Err(_) => return Err(PrewarmError::PipeBroken.into()),
            }
        } else if revents.contains(PollFlags::POLLHUP) {
            return Err(PrewarmError::PipeBroken.into());
        }
        Ok(())
    }
}

fn poll_timeout(duration: Duration) -> PollTimeout {
    PollTimeout::from(duration.as_millis().min(u16::MAX as u128) as u16)
}
