//! Fork engine: turns one decoded request into a live child wired for death
//! detection, readiness gating, and dispatch.
//!
//! The death detector doubles as the fork handshake: the child writes one
//! byte on the pipe's write end and then keeps that end open for life, so
//! the same fd acknowledges the fork and, on close at process exit, reports
//! the death.

use crate::config::Options;
use crate::errors::PrewarmError;
use crate::poller::set_cloexec;
use crate::protocol::ForkRequest;
use crate::registry::{Invocation, Registry};
use crate::shm::{SharedMemory, SharedReader};
use crate::signals;
use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{fork, pipe, setsid, tcsetpgrp, ForkResult, Pid};
use std::ffi::CString;
use std::io::Write as _;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};

/// A decoded fork request plus where its stdin bytes live in the region.
#[derive(Debug)]
pub struct PreparedRequest {
    pub request: ForkRequest,
    pub shm_name: String,
    pub stdin_offset: usize,
}

/// Read and decode a fork request from the named region.
///
/// The region stays linked: it is controller-owned until the fork is
/// acknowledged, child-owned after.
pub fn read_request(shm_name: &str) -> Result<PreparedRequest, PrewarmError> {
    let mut shm = SharedMemory::open(shm_name)?;
    let payload = shm.read_data_with_size()?;
    let request: ForkRequest = serde_json::from_slice(&payload)?;
    let stdin_offset = shm.tell();
    if request.stdin_size > 0 && stdin_offset + request.stdin_size > shm.len() {
        return Err(PrewarmError::ShmTruncated {
            name: shm_name.to_string(),
            need: stdin_offset + request.stdin_size,
            have: shm.len(),
        });
    }
    Ok(PreparedRequest {
        request,
        shm_name: shm_name.to_string(),
        stdin_offset,
    })
}

/// The readiness-gate ends a fork needs: the child keeps `read` and closes
/// its inherited copy of the supervisor's `write_fd`, so the gate hangs up
/// cleanly once the supervisor drops its end.
pub struct ReadyGate {
    pub read: OwnedFd,
    pub write_fd: RawFd,
}

/// Fork a child for `prepared`, handing it the readiness gate. Returns the
/// child pid and the death-detector read end once the child has written its
/// acknowledgement byte. Never returns in the child.
pub fn spawn(
    prepared: &PreparedRequest,
    gate: ReadyGate,
    registry: &Registry,
    options: &Options,
) -> Result<(Pid, OwnedFd)> {
    let (death_read, death_write) = pipe().context("death detector pipe")?;
    set_cloexec(death_read.as_raw_fd(), true).context("death detector flags")?;

    match unsafe { fork() }.context("fork syscall failed")? {
        ForkResult::Parent { child } => {
            drop(death_write);
            drop(gate.read);
            await_fork_ack(&death_read)?;
            Ok((child, death_read))
        }
        ForkResult::Child => {
            drop(death_read);
            child_main(prepared, gate.read, gate.write_fd, death_write, registry, options)
        }
    }
}

/// Parent side of the handshake: one sentinel byte, or the child is gone.
fn await_fork_ack(death_read: &OwnedFd) -> Result<()> {
    let mut fds = [PollFd::new(death_read.as_fd(), PollFlags::POLLIN)];
    loop {
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno).context("poll fork handshake"),
        }
    }
    let revents = fds[0].revents().unwrap_or(PollFlags::empty());
    if !revents.contains(PollFlags::POLLIN) {
        return Err(PrewarmError::ForkHandshakeFailed.into());
    }
    let mut byte = [0u8; 1];
    crate::poller::read_fd(death_read.as_raw_fd(), &mut byte).context("read fork ack")?;
    Ok(())
}

/// Child side. Any failure exits the process; control never returns to the
/// supervisor loop.
fn child_main(
    prepared: &PreparedRequest,
    ready_read: OwnedFd,
    ready_write_fd: RawFd,
    death_write: OwnedFd,
    registry: &Registry,
    options: &Options,
) -> ! {
    let code = match run_child(prepared, ready_read, ready_write_fd, death_write, registry, options)
    {
        Ok(code) => code,
        Err(err) => {
            eprintln!("[child] {err:#}");
            1
        }
    };
    std::process::exit(code);
}

fn run_child(
    prepared: &PreparedRequest,
    ready_read: OwnedFd,
    ready_write_fd: RawFd,
    death_write: OwnedFd,
    registry: &Registry,
    options: &Options,
) -> Result<i32> {
    // The write end stays open for life; its close at process exit is the
    // death signal. CLOEXEC keeps it from leaking into anything we exec.
    set_cloexec(death_write.as_raw_fd(), true).context("death detector flags")?;
    // Our inherited copy of the supervisor's gate end must go, or the gate
    // could never hang up for us.
    unsafe { libc::close(ready_write_fd) };

    signals::reset_child_signals();
    setsid().context("setsid")?;

    let request = &prepared.request;
    if !request.tty_name.is_empty() {
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();
        establish_controlling_tty(&request.tty_name)?;
    }

    // Acknowledge the fork; the supervisor reads this byte before emitting
    // CHILD:, so the controller never sees an id for an unborn child.
    crate::poller::write_fd(death_write.as_raw_fd(), b"1").context("fork handshake write")?;

    // The region is ours now. Adopt it for stdin, or just retire the name.
    let stdin = if request.stdin_size > 0 {
        let shm = SharedMemory::adopt(&prepared.shm_name)?;
        Some(SharedReader::new(
            shm,
            prepared.stdin_offset,
            request.stdin_size,
        )?)
    } else {
        let _ = SharedMemory::unlink_region(&prepared.shm_name);
        None
    };

    if !request.cwd.is_empty() {
        let _ = std::env::set_current_dir(&request.cwd);
    }
    replace_env(&request.env);

    // Block on the readiness gate. A hang-up without the release byte means
    // nobody is coming: exit without dispatching.
    if !wait_for_release(&ready_read)? {
        return Ok(0);
    }
    drop(ready_read);

    dispatch(request, stdin, registry, options)
}

fn replace_env(env: &std::collections::HashMap<String, String>) {
    let current: Vec<std::ffi::OsString> = std::env::vars_os().map(|(key, _)| key).collect();
    for key in current {
        std::env::remove_var(&key);
    }
    for (key, value) in env {
        std::env::set_var(key, value);
    }
}

/// Wait on the readiness gate. Returns true if the release byte arrived.
fn wait_for_release(ready_read: &OwnedFd) -> Result<bool> {
    let mut fds = [PollFd::new(
        ready_read.as_fd(),
        PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP,
    )];
    loop {
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno).context("poll readiness gate"),
        }
    }
    let revents = fds[0].revents().unwrap_or(PollFlags::empty());
    Ok(revents.contains(PollFlags::POLLIN))
}

/// Open the named device, make it our controlling terminal, and rebind
/// stdio to it.
fn establish_controlling_tty(tty_name: &str) -> Result<()> {
    let name = CString::new(tty_name).context("tty name contains NUL")?;
    let fd = unsafe { libc::open(name.as_ptr(), libc::O_RDWR | libc::O_NOCTTY) };
    if fd < 0 {
        bail!(
            "open tty {tty_name}: {}",
            std::io::Error::last_os_error()
        );
    }
    unsafe {
        if libc::ioctl(fd, libc::TIOCSCTTY as _, 0) < 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            bail!("acquire controlling tty {tty_name}: {err}");
        }
        for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
            if libc::dup2(fd, target) < 0 {
                let err = std::io::Error::last_os_error();
                libc::close(fd);
                bail!("rebind fd {target} to {tty_name}: {err}");
            }
        }
        if fd > libc::STDERR_FILENO {
            libc::close(fd);
        }
    }
    let _ = tcsetpgrp(std::io::stdin(), nix::unistd::getpid());
    Ok(())
}

/// Tail-call into the prewarmed dispatch table.
fn dispatch(
    request: &ForkRequest,
    stdin: Option<SharedReader>,
    registry: &Registry,
    options: &Options,
) -> Result<i32> {
    let mut stream: Box<dyn std::io::Read> = match stdin {
        Some(reader) => Box::new(reader),
        None => Box::new(std::io::stdin()),
    };
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut invocation = Invocation {
        argv: &request.argv,
        stdin: &mut *stream,
        stdout: &mut out,
        options,
    };
    registry.dispatch(&mut invocation)
}
