//! End-to-end tests: a real controller client driving a real supervisor
//! process over pipes, with children attached to real ptys.

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::pty::openpty;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use prewarm_core::client::Client;
use prewarm_core::config::PrewarmConfig;
use prewarm_core::errors::PrewarmError;
use prewarm_core::protocol::ForkRequest;
use std::collections::HashMap;
use std::io::Write;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use wait_timeout::ChildExt;

fn spawn_client() -> Client {
    Client::spawn_exe(
        Path::new(env!("CARGO_BIN_EXE_prewarm-core")),
        &PrewarmConfig::default(),
    )
    .unwrap()
}

fn base_env() -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
    env
}

struct TestTty {
    master: OwnedFd,
    _slave: OwnedFd,
    name: String,
}

fn open_tty() -> TestTty {
    let pty = openpty(
        None::<&nix::pty::Winsize>,
        None::<&nix::sys::termios::Termios>,
    )
    .unwrap();
    let name = tty_path(pty.slave.as_raw_fd());
    TestTty {
        master: pty.master,
        _slave: pty.slave,
        name,
    }
}

fn tty_path(fd: RawFd) -> String {
    let mut buf = [0 as libc::c_char; 128];
    let rc = unsafe { libc::ttyname_r(fd, buf.as_mut_ptr(), buf.len()) };
    assert_eq!(rc, 0, "ttyname_r failed");
    unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

/// Read from the pty master until `done` is satisfied or the deadline
/// passes. Output is normalized: the pty's \r\n becomes \n.
fn read_master_until(master: &OwnedFd, done: impl Fn(&str) -> bool, timeout: Duration) -> String {
    let mut out = Vec::new();
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done(&normalize(&out)) {
            break;
        }
        let mut fds = [PollFd::new(master.as_fd(), PollFlags::POLLIN)];
        let _ = poll(&mut fds, PollTimeout::from(100u16));
        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        if revents.contains(PollFlags::POLLIN) {
            let mut buf = [0u8; 4096];
            let n = unsafe {
                libc::read(
                    master.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
            out.extend_from_slice(&buf[..n as usize]);
        } else if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP) {
            break;
        }
    }
    normalize(&out)
}

fn normalize(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).replace('\r', "")
}

/// Drain death notifications until `pid` shows up or the deadline passes.
fn wait_for_death(client: &mut Client, pid: i32, timeout: Duration) -> Vec<i32> {
    let mut seen = Vec::new();
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        seen.extend(client.dead_children().unwrap());
        if seen.contains(&pid) {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    seen
}

fn pid_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

// =============================================================================
// Liveness & failure handling
// =============================================================================

#[test]
fn test_echo_liveness_probe() {
    let mut client = spawn_client();
    assert_eq!(client.echo("ping").unwrap(), "ping");
    assert_eq!(client.echo("with:colons:kept").unwrap(), "with:colons:kept");
}

#[test]
fn test_fork_failure_reports_err_and_supervisor_survives() {
    let mut client = spawn_client();
    let request = ForkRequest {
        tty_name: "/dev/does-not-exist".to_string(),
        cwd: "/tmp".to_string(),
        argv: vec!["pwd".to_string()],
        env: base_env(),
        ..Default::default()
    };
    let err = client.fork(&request, None).unwrap_err();
    match err.downcast_ref::<PrewarmError>() {
        Some(PrewarmError::ForkRejected(message)) => {
            assert!(!message.is_empty());
        }
        other => panic!("expected ForkRejected, got {other:?}"),
    }
    // No child id was handed out, nothing appears on the death channel
    std::thread::sleep(Duration::from_millis(100));
    assert!(client.dead_children().unwrap().is_empty());
    // The supervisor is still responsive
    assert_eq!(client.echo("ping").unwrap(), "ping");
}

// =============================================================================
// Fork semantics
// =============================================================================

#[test]
fn test_fork_runs_kitten_on_requested_tty_and_cwd() {
    let mut client = spawn_client();
    let tty = open_tty();
    let dir = tempfile::tempdir().unwrap();
    let cwd = std::fs::canonicalize(dir.path()).unwrap();

    let request = ForkRequest {
        tty_name: tty.name.clone(),
        cwd: cwd.display().to_string(),
        argv: vec!["pwd".to_string()],
        env: base_env(),
        ..Default::default()
    };
    let child = client.fork(&request, None).unwrap();
    assert_eq!(child.child_id, 0);
    assert!(child.pid > 0);

    // Handshake ordering: nothing may reach the tty before the release
    let before = read_master_until(&tty.master, |s| !s.is_empty(), Duration::from_millis(300));
    assert!(before.is_empty(), "child ran before release: {before:?}");

    assert!(client.mark_child_ready(child.child_id).unwrap());
    let out = read_master_until(
        &tty.master,
        |s| s.contains('\n'),
        Duration::from_secs(5),
    );
    assert_eq!(out.trim_end(), cwd.display().to_string());

    let seen = wait_for_death(&mut client, child.pid, Duration::from_secs(5));
    assert_eq!(seen.iter().filter(|&&p| p == child.pid).count(), 1);
}

#[test]
fn test_stdin_payload_roundtrip() {
    let mut client = spawn_client();
    let tty = open_tty();
    let request = ForkRequest {
        tty_name: tty.name.clone(),
        cwd: "/tmp".to_string(),
        argv: vec!["echo".to_string()],
        env: base_env(),
        ..Default::default()
    };
    let child = client.fork(&request, Some(b"hello")).unwrap();
    assert!(client.mark_child_ready(child.child_id).unwrap());
    let out = read_master_until(&tty.master, |s| s.contains("hello"), Duration::from_secs(5));
    assert!(out.contains("hello"), "stdin not delivered: {out:?}");
}

#[test]
fn test_child_env_is_replaced_from_request() {
    let mut client = spawn_client();
    let tty = open_tty();
    let mut env = base_env();
    env.insert("PREWARM_MARKER".to_string(), "42".to_string());
    let request = ForkRequest {
        tty_name: tty.name.clone(),
        cwd: "/tmp".to_string(),
        argv: vec!["env".to_string()],
        env,
        ..Default::default()
    };
    let child = client.fork(&request, None).unwrap();
    assert!(client.mark_child_ready(child.child_id).unwrap());
    let out = read_master_until(
        &tty.master,
        |s| s.contains("PREWARM_MARKER"),
        Duration::from_secs(5),
    );
    assert!(out.contains("PREWARM_MARKER=42"), "env not applied: {out:?}");
}

#[test]
fn test_child_ids_are_monotonic() {
    let mut client = spawn_client();
    let request = ForkRequest {
        cwd: "/tmp".to_string(),
        argv: vec!["sleep".to_string(), "30".to_string()],
        env: base_env(),
        ..Default::default()
    };
    let mut ids = Vec::new();
    let mut pids = Vec::new();
    for _ in 0..3 {
        let child = client.fork(&request, None).unwrap();
        ids.push(child.child_id);
        pids.push(child.pid);
    }
    assert_eq!(ids, vec![0, 1, 2]);
    let mut unique = pids.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 3);

    // Cancellation: kill the gated children directly; every pid is
    // reported exactly once on the death channel
    for (id, pid) in ids.iter().zip(pids.iter()) {
        assert!(client.kill_child(*id).unwrap());
        let seen = wait_for_death(&mut client, *pid, Duration::from_secs(5));
        assert_eq!(seen.iter().filter(|&&p| p == *pid).count(), 1);
    }
}

#[test]
fn test_killed_before_ready_then_ready_is_ignored() {
    let mut client = spawn_client();
    let request = ForkRequest {
        cwd: "/tmp".to_string(),
        argv: vec!["sleep".to_string(), "30".to_string()],
        env: base_env(),
        ..Default::default()
    };
    let child = client.fork(&request, None).unwrap();
    assert_eq!(client.tracked_children(), 1);

    kill(Pid::from_raw(child.pid), Signal::SIGKILL).unwrap();
    let seen = wait_for_death(&mut client, child.pid, Duration::from_secs(5));
    assert!(seen.contains(&child.pid));
    assert_eq!(client.tracked_children(), 0);

    // The death drain dropped the record: a late release is a local no-op
    assert!(!client.mark_child_ready(child.child_id).unwrap());
    // And the supervisor is still healthy
    assert_eq!(client.echo("still-alive").unwrap(), "still-alive");
}

#[test]
fn test_ready_release_is_at_most_once() {
    let mut client = spawn_client();
    let request = ForkRequest {
        cwd: "/tmp".to_string(),
        argv: vec!["sleep".to_string(), "0.1".to_string()],
        env: base_env(),
        ..Default::default()
    };
    let child = client.fork(&request, None).unwrap();
    assert!(client.mark_child_ready(child.child_id).unwrap());
    assert!(!client.mark_child_ready(child.child_id).unwrap());

    let seen = wait_for_death(&mut client, child.pid, Duration::from_secs(5));
    assert_eq!(seen.iter().filter(|&&p| p == child.pid).count(), 1);
}

// =============================================================================
// Configuration
// =============================================================================

#[test]
fn test_config_reload_is_visible_to_later_forks() {
    let mut client = spawn_client();
    let tty = open_tty();
    client
        .reload_config(&PrewarmConfig {
            paths: vec!["/tmp/alt-kitty.conf".to_string()],
            overrides: vec!["font_size=13".to_string()],
        })
        .unwrap();

    let request = ForkRequest {
        tty_name: tty.name.clone(),
        cwd: "/tmp".to_string(),
        argv: vec!["config".to_string()],
        env: base_env(),
        ..Default::default()
    };
    let child = client.fork(&request, None).unwrap();
    assert!(client.mark_child_ready(child.child_id).unwrap());
    let out = read_master_until(
        &tty.master,
        |s| s.contains("alt-kitty.conf"),
        Duration::from_secs(5),
    );
    assert!(out.contains("/tmp/alt-kitty.conf"), "config not reloaded: {out:?}");
    assert!(out.contains("\"font_size\":\"13\""), "override missing: {out:?}");
}

// =============================================================================
// Shutdown & resource accounting
// =============================================================================

#[test]
fn test_graceful_shutdown_leaves_released_children_running() {
    let mut client = spawn_client();
    let request = ForkRequest {
        cwd: "/tmp".to_string(),
        argv: vec!["sleep".to_string(), "10".to_string()],
        env: base_env(),
        ..Default::default()
    };
    let child = client.fork(&request, None).unwrap();
    assert!(client.mark_child_ready(child.child_id).unwrap());
    // Give the release byte time to land before the pipes close
    std::thread::sleep(Duration::from_millis(200));

    let status = client.shutdown().unwrap();
    assert_eq!(status.code(), Some(0));
    assert!(pid_alive(child.pid), "released child should outlive the supervisor");
    let _ = kill(Pid::from_raw(child.pid), Signal::SIGKILL);
}

#[test]
fn test_no_fd_leak_across_fork_cycles() {
    let mut client = spawn_client();
    // Settle into steady state before taking the baseline
    assert_eq!(client.echo("warm").unwrap(), "warm");
    let supervisor_pid = client.supervisor_pid().unwrap();
    let baseline = open_fd_count(supervisor_pid);

    let request = ForkRequest {
        cwd: "/tmp".to_string(),
        argv: vec!["sleep".to_string(), "30".to_string()],
        env: base_env(),
        ..Default::default()
    };
    for _ in 0..5 {
        let child = client.fork(&request, None).unwrap();
        assert!(client.kill_child(child.child_id).unwrap());
        let seen = wait_for_death(&mut client, child.pid, Duration::from_secs(5));
        assert!(seen.contains(&child.pid));
    }
    // One echo roundtrip makes sure the death handling ticks are done
    assert_eq!(client.echo("done").unwrap(), "done");
    assert_eq!(open_fd_count(supervisor_pid), baseline);
}

fn open_fd_count(pid: u32) -> usize {
    std::fs::read_dir(format!("/proc/{pid}/fd")).unwrap().count()
}

// =============================================================================
// Direct binary contract
// =============================================================================

#[test]
fn test_supervisor_exits_zero_on_stdin_eof() {
    let (death_read, death_write) = nix::unistd::pipe().unwrap();
    let mut process = Command::new(env!("CARGO_BIN_EXE_prewarm-core"))
        .arg("supervise")
        .arg("--notify-fd")
        .arg(death_write.as_raw_fd().to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .spawn()
        .unwrap();
    drop(death_write);
    drop(death_read);

    drop(process.stdin.take());
    let status = process
        .wait_timeout(Duration::from_secs(5))
        .unwrap()
        .expect("supervisor did not exit after stdin EOF");
    assert_eq!(status.code(), Some(0));
}

#[test]
fn test_supervisor_exits_nonzero_on_bad_notify_fd() {
    let mut process = Command::new(env!("CARGO_BIN_EXE_prewarm-core"))
        .arg("supervise")
        .arg("--notify-fd")
        .arg("242")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let status = process
        .wait_timeout(Duration::from_secs(5))
        .unwrap()
        .expect("supervisor did not exit on a bad notify fd");
    assert_eq!(status.code(), Some(1));
}

#[test]
fn test_kitten_subcommand_runs_against_stdio() {
    let mut process = Command::new(env!("CARGO_BIN_EXE_prewarm-core"))
        .arg("kitten")
        .arg("echo")
        .arg("hi")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    process
        .stdin
        .take()
        .unwrap()
        .write_all(b"from stdin")
        .unwrap();
    let output = process.wait_with_output().unwrap();
    assert!(output.status.success());
    assert_eq!(output.stdout, b"hi\nfrom stdin");
}
