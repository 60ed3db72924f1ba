//! Signal dispositions for the supervisor and its forked children.
//!
//! The supervisor never calls wait(): child exits are observed through the
//! death-detector pipes, so SIGCHLD is ignored and the kernel reaps for us.
//! SIGPIPE is ignored so a vanished controller surfaces as EPIPE from write,
//! not as process death. Shutdown signals set a flag checked by the poll
//! loop; signal-hook's flag registration keeps the loop single-threaded.

use nix::sys::signal::{signal, SigHandler, Signal};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

fn shutdown_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

/// Install the supervisor's signal dispositions. Must run before the first
/// fork so children start from a known state.
pub fn install_supervisor_handlers() -> anyhow::Result<()> {
    unsafe {
        signal(Signal::SIGCHLD, SigHandler::SigIgn)?;
        signal(Signal::SIGPIPE, SigHandler::SigIgn)?;
    }
    signal_hook::flag::register(SIGTERM, Arc::clone(shutdown_flag()))?;
    signal_hook::flag::register(SIGINT, Arc::clone(shutdown_flag()))?;
    Ok(())
}

/// Check if shutdown was requested (called in the poll loop; the signal
/// itself interrupts poll with EINTR).
#[inline]
pub fn shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::SeqCst)
}

/// Restore default dispositions in a freshly forked child.
///
/// The parent ignores SIGCHLD to stay zombie-free, but a dispatched kitten
/// that spawns its own processes needs working waitpid again.
pub fn reset_child_signals() {
    unsafe {
        let _ = signal(Signal::SIGCHLD, SigHandler::SigDfl);
        let _ = signal(Signal::SIGPIPE, SigHandler::SigDfl);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_flag() {
        assert!(!shutdown_requested());
        shutdown_flag().store(true, Ordering::SeqCst);
        assert!(shutdown_requested());
        shutdown_flag().store(false, Ordering::SeqCst);
    }
}
