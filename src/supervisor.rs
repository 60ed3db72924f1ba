//! The supervisor: a single-threaded poll loop servicing fork requests.
//!
//! One instance per controller. Owns two pipes per live child (readiness
//! gate write end, death detector read end) plus the control pipes on
//! stdin/stdout and the inherited death-notification fd. Nothing here
//! blocks except poll itself; all output is buffered and drained under
//! POLLOUT.

use crate::child::{self, ReadyGate};
use crate::config::{self, Options};
use crate::poller::{self, error_events, PollSet};
use crate::protocol::{self, Command, LineBuffer};
use crate::registry::Registry;
use crate::signals;
use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::poll::{PollFlags, PollTimeout};
use nix::unistd::{pipe, Pid};
use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Instant;

const READ_CHUNK: usize = 8192;

/// Bookkeeping for one live child.
struct ChildRecord {
    pid: Pid,
    /// Write end of the readiness gate; present until released or reaped.
    ready_write: Option<OwnedFd>,
    /// Read end of the death detector; HUP here means the child exited.
    death_read: OwnedFd,
}

/// What a handler decided about the loop.
enum Tick {
    Continue,
    Shutdown(i32),
}

pub struct Supervisor {
    stdin_fd: RawFd,
    stdout_fd: RawFd,
    notify_fd: OwnedFd,
    poll: PollSet,
    input: LineBuffer,
    output_buf: Vec<u8>,
    child_death_buf: Vec<u8>,
    children: HashMap<u64, ChildRecord>,
    next_child_id: u64,
    registry: Registry,
    options: Options,
}

/// Entry point for the `supervise` subcommand. Claims the inherited
/// notification fd and runs the loop; the return value is the process exit
/// code.
pub fn run_supervisor(notify_fd: RawFd) -> Result<i32> {
    signals::install_supervisor_handlers()?;
    let notify_fd = unsafe { OwnedFd::from_raw_fd(notify_fd) };
    let mut supervisor = Supervisor::new(notify_fd)?;
    supervisor.run()
}

impl Supervisor {
    pub fn new(notify_fd: OwnedFd) -> Result<Self> {
        let start = Instant::now();
        let options = config::reload_from_env()?;
        let registry = Registry::prewarmed();
        eprintln!(
            "[supervisor] Prewarmed {} kittens in {:?}",
            registry.len(),
            start.elapsed()
        );

        let stdin_fd = libc::STDIN_FILENO;
        let stdout_fd = libc::STDOUT_FILENO;
        poller::set_nonblocking(stdin_fd, true).context("stdin flags")?;
        poller::set_nonblocking(stdout_fd, true).context("stdout flags")?;
        poller::set_nonblocking(notify_fd.as_raw_fd(), true).context("notify fd flags")?;

        let mut poll = PollSet::new();
        poll.register(stdin_fd, PollFlags::POLLIN);

        Ok(Self {
            stdin_fd,
            stdout_fd,
            notify_fd,
            poll,
            input: LineBuffer::new(),
            output_buf: Vec::new(),
            child_death_buf: Vec::new(),
            children: HashMap::new(),
            next_child_id: 0,
            registry,
            options,
        })
    }

    /// Run until the controller hangs up or a shutdown signal arrives.
    /// Dropping the supervisor closes every pending readiness gate, which
    /// unblocks gated children into a dispatch-free exit; released children
    /// keep running unaffected.
    pub fn run(&mut self) -> Result<i32> {
        loop {
            if signals::shutdown_requested() {
                eprintln!("[supervisor] Shutdown requested");
                return Ok(0);
            }
            if !self.output_buf.is_empty() {
                self.poll.register(self.stdout_fd, PollFlags::POLLOUT);
            }
            if !self.child_death_buf.is_empty() {
                self.poll
                    .register(self.notify_fd.as_raw_fd(), PollFlags::POLLOUT);
            }
            let ready = match self.poll.wait(PollTimeout::NONE) {
                Ok(ready) => ready,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno).context("poll control fds"),
            };
            for (fd, revents) in ready {
                let tick = if fd == self.stdin_fd {
                    self.handle_input(revents)?
                } else if fd == self.stdout_fd {
                    self.handle_output(revents)?
                } else if fd == self.notify_fd.as_raw_fd() {
                    self.handle_notify_child_death(revents)?
                } else {
                    self.handle_child_death(fd, revents);
                    Tick::Continue
                };
                if let Tick::Shutdown(code) = tick {
                    return Ok(code);
                }
            }
        }
    }

    // =========================================================================
    // Control pipe handlers
    // =========================================================================

    fn handle_input(&mut self, revents: PollFlags) -> Result<Tick> {
        if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
            eprintln!("[supervisor] Polling of stdin failed");
            return Ok(Tick::Shutdown(1));
        }
        if revents.contains(PollFlags::POLLIN) {
            let mut buf = [0u8; READ_CHUNK];
            match poller::read_fd(self.stdin_fd, &mut buf) {
                Ok(0) => return Ok(Tick::Shutdown(0)),
                Ok(n) => self.input.extend(&buf[..n]),
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
                    ) => {}
                Err(err) => return Err(err).context("read control pipe"),
            }
            while let Some(line) = self.input.next_line() {
                match line {
                    Ok(line) => self.execute_frame(&line),
                    Err(err) => eprintln!("[supervisor] {err}"),
                }
            }
            return Ok(Tick::Continue);
        }
        if revents.contains(PollFlags::POLLHUP) {
            return Ok(Tick::Shutdown(0));
        }
        Ok(Tick::Continue)
    }

    fn handle_output(&mut self, revents: PollFlags) -> Result<Tick> {
        self.drain_buffer(revents, BufKind::Output)
    }

    fn handle_notify_child_death(&mut self, revents: PollFlags) -> Result<Tick> {
        self.drain_buffer(revents, BufKind::ChildDeath)
    }

    fn drain_buffer(&mut self, revents: PollFlags, kind: BufKind) -> Result<Tick> {
        if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
            eprintln!("[supervisor] Polling of an output fd failed");
            return Ok(Tick::Shutdown(1));
        }
        if revents.contains(PollFlags::POLLHUP) && !revents.contains(PollFlags::POLLOUT) {
            return Ok(Tick::Shutdown(0));
        }
        if !revents.contains(PollFlags::POLLOUT) {
            return Ok(Tick::Continue);
        }
        let fd = match kind {
            BufKind::Output => self.stdout_fd,
            BufKind::ChildDeath => self.notify_fd.as_raw_fd(),
        };
        let buf = match kind {
            BufKind::Output => &mut self.output_buf,
            BufKind::ChildDeath => &mut self.child_death_buf,
        };
        if !buf.is_empty() {
            match poller::write_fd(fd, buf) {
                Ok(0) => return Ok(Tick::Shutdown(0)),
                Ok(n) => {
                    buf.drain(..n);
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
                    ) => {}
                Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                    return Ok(Tick::Shutdown(0));
                }
                Err(err) => return Err(err).context("write control pipe"),
            }
        }
        if buf.is_empty() {
            self.poll.unregister(fd);
        }
        Ok(Tick::Continue)
    }

    // =========================================================================
    // Command execution
    // =========================================================================

    fn execute_frame(&mut self, line: &str) {
        match protocol::parse_command(line) {
            Ok(Command::Echo { text }) => {
                self.output_buf.extend_from_slice(text.as_bytes());
                self.output_buf.push(b'\n');
            }
            Ok(Command::ReloadConfig { payload }) => {
                std::env::set_var(config::CONFIG_ENV_VAR, &payload);
                match config::reload_from_env() {
                    Ok(options) => {
                        self.options = options;
                        eprintln!("[supervisor] Configuration reloaded");
                    }
                    Err(err) => eprintln!("[supervisor] Config reload failed: {err:#}"),
                }
            }
            Ok(Command::Ready { child_id }) => self.release_child(child_id),
            Ok(Command::Fork { shm_name }) => self.handle_fork(&shm_name),
            Err(err) => eprintln!("[supervisor] {err}"),
        }
    }

    /// Open the readiness gate. Unknown ids and repeat releases are ignored.
    fn release_child(&mut self, child_id: u64) {
        if let Some(record) = self.children.get_mut(&child_id) {
            if let Some(ready_write) = record.ready_write.take() {
                let _ = poller::write_fd(ready_write.as_raw_fd(), b"1");
            }
        }
    }

    fn handle_fork(&mut self, shm_name: &str) {
        match self.fork_child(shm_name) {
            Ok((child_id, pid)) => {
                self.output_buf
                    .extend_from_slice(protocol::child_frame(child_id, pid.as_raw()).as_bytes());
            }
            Err(err) => {
                eprintln!("[supervisor] Fork failed: {err:#}");
                self.output_buf
                    .extend_from_slice(protocol::err_frame(&format!("{err:#}")).as_bytes());
            }
        }
    }

    fn fork_child(&mut self, shm_name: &str) -> Result<(u64, Pid)> {
        let prepared = child::read_request(shm_name)?;
        let (ready_read, ready_write) = pipe().context("readiness pipe")?;
        poller::set_cloexec(ready_write.as_raw_fd(), true).context("readiness pipe flags")?;
        let gate = ReadyGate {
            read: ready_read,
            write_fd: ready_write.as_raw_fd(),
        };
        let (pid, death_read) = child::spawn(&prepared, gate, &self.registry, &self.options)?;
        let child_id = self.next_child_id;
        self.next_child_id += 1;
        self.poll.register(death_read.as_raw_fd(), PollFlags::POLLIN);
        self.children.insert(
            child_id,
            ChildRecord {
                pid,
                ready_write: Some(ready_write),
                death_read,
            },
        );
        Ok((child_id, pid))
    }

    // =========================================================================
    // Death handling
    // =========================================================================

    /// A death-detector fd fired. HUP retires the child: its record (and
    /// with it any still-pending readiness gate) drops, and the pid is
    /// queued for the controller's death channel.
    fn handle_child_death(&mut self, fd: RawFd, revents: PollFlags) {
        if revents.contains(PollFlags::POLLIN) {
            // Stray data on a death detector; drain it so poll settles.
            let mut sink = [0u8; 32];
            let _ = poller::read_fd(fd, &mut sink);
        }
        if !revents.intersects(error_events()) {
            return;
        }
        self.poll.unregister(fd);
        let child_id = self
            .children
            .iter()
            .find(|(_, record)| record.death_read.as_raw_fd() == fd)
            .map(|(id, _)| *id);
        if let Some(child_id) = child_id {
            if let Some(record) = self.children.remove(&child_id) {
                self.child_death_buf
                    .extend_from_slice(format!("{}\n", record.pid.as_raw()).as_bytes());
            }
        }
    }
}

enum BufKind {
    Output,
    ChildDeath,
}
