//! Per-child termination watcher
//!
//! Each spawned child gets one dedicated OS thread whose only job is a
//! blocking `waitpid`. The thread is started *before* the fork and parked on
//! a channel until the spawn pipeline either hands it the coordinator for
//! the successfully forked pid (`resume`) or abandons it (`cancel`). That
//! ordering means the watcher can never race the fork and never waits on a
//! pid it does not know.
//!
//! The thread detaches itself: nothing joins it, and it owns the only
//! watcher-side reference to the coordinator, so there is no reference
//! cycle back from the coordinator.

use std::sync::mpsc;
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitStatus};
use tracing::{debug, warn};

use crate::process::{ExitStatus, ProcessShared};

enum Command {
    Resume(Arc<ProcessShared>),
    Cancel,
}

/// Control handle for one parked watcher thread.
///
/// Exactly one of [`resume`](Self::resume) or [`cancel`](Self::cancel) must
/// be called; both consume the handle.
pub(crate) struct WatcherHandle {
    tx: mpsc::Sender<Command>,
}

impl WatcherHandle {
    /// The fork succeeded: hand the watcher the coordinator to notify.
    pub(crate) fn resume(self, shared: Arc<ProcessShared>) {
        if self.tx.send(Command::Resume(shared)).is_err() {
            warn!("watcher thread exited before resume");
        }
    }

    /// The fork failed: release the watcher without waiting on anything.
    pub(crate) fn cancel(self) {
        let _ = self.tx.send(Command::Cancel);
    }
}

/// Start a watcher thread in its paused state.
pub(crate) fn spawn() -> std::io::Result<WatcherHandle> {
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("procyon-waitpid".to_string())
        .spawn(move || match rx.recv() {
            Ok(Command::Resume(shared)) => watch(shared),
            Ok(Command::Cancel) | Err(_) => {}
        })?;
    Ok(WatcherHandle { tx })
}

/// Blocking `waitpid` loop for one child.
fn watch(shared: Arc<ProcessShared>) {
    let pid = shared.pid();
    let status = loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => {
                debug_assert!(code >= 0, "exit code from WEXITSTATUS must be non-negative");
                break ExitStatus::exited(code);
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => break ExitStatus::signaled(signal),
            // Stop/continue notifications are not terminal; keep waiting.
            Ok(_) => continue,
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(Errno::ECHILD) => {
                // Someone else reaped the child; its status is lost.
                warn!(pid = %pid, "waitpid lost the child (ECHILD), reporting unknown status");
                break ExitStatus::UNKNOWN;
            }
            Err(e) => {
                // EINVAL/ESRCH from waitpid mean the call itself was built
                // wrong; there is no child state to recover.
                panic!("waitpid({pid}) failed: {e}");
            }
        }
    };
    debug!(pid = %pid, status = %status, "child terminated");
    shared.complete(status);
}
