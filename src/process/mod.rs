//! Subprocess coordination: lifecycle state machine and waiter registry
//!
//! A [`Subprocess`] is the public handle to one spawned child. It owns the
//! child's parent-side streams and shares the coordinator state with the
//! termination watcher thread:
//!
//! ```text
//! [Running] --terminate/kill--> [Running]        (signal delivered)
//! [Running] --watcher reports--> [Terminated(s)]
//! [Terminated] --any op-->       [Terminated]    (idempotent)
//! ```
//!
//! Termination happens exactly once, freezes the exit status, closes stdin,
//! requests a drain-aware close of stdout/stderr, and wakes every waiter.
//! Waiters are plain futures: polling registers a waker in the coordinator's
//! registry under its lock, dropping the future deregisters it under the
//! same lock, so a cancelled wait can neither leak a registration nor
//! swallow a termination meant for someone else.

mod init;

use std::collections::HashMap;
use std::ffi::OsString;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{Env, OutputConfig, StdinConfig};
use crate::error::{ProcessError, Result, SpawnError};
use crate::stream::{InputInner, InputStream, OutputInner, OutputStream};

/// Exit status of a terminated child.
///
/// The raw value follows the POSIX-library convention: a normal exit is the
/// raw code in `[0, 255]`, a signal-caused death is the negated signal
/// number, and `255` doubles as the "unknown" sentinel for a child that was
/// lost before the watcher could observe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExitStatus(i32);

impl ExitStatus {
    /// Sentinel for a child whose real status could not be observed.
    pub const UNKNOWN: ExitStatus = ExitStatus(255);

    pub(crate) fn exited(code: i32) -> Self {
        Self(code)
    }

    pub(crate) fn signaled(signal: Signal) -> Self {
        Self(-(signal as i32))
    }

    /// The raw status integer.
    pub const fn as_raw(self) -> i32 {
        self.0
    }

    /// `true` iff the child exited normally with code 0.
    pub const fn success(self) -> bool {
        self.0 == 0
    }

    /// The exit code, if the child exited normally.
    pub const fn code(self) -> Option<i32> {
        if self.0 >= 0 {
            Some(self.0)
        } else {
            None
        }
    }

    /// The signal number, if the child was killed by a signal.
    pub const fn signal(self) -> Option<i32> {
        if self.0 < 0 {
            Some(-self.0)
        } else {
            None
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.signal() {
            Some(signal) => write!(f, "terminated by signal {signal}"),
            None => write!(f, "exit code {}", self.0),
        }
    }
}

#[derive(Debug, Default)]
struct WaiterRegistry {
    status: Option<ExitStatus>,
    waiters: HashMap<u64, Waker>,
    next_waiter_id: u64,
}

/// Coordinator state shared between the [`Subprocess`] handle and the
/// watcher thread. The watcher holds the only reference that outlives the
/// handle; the coordinator holds no reference back to the watcher.
#[derive(Debug)]
pub(crate) struct ProcessShared {
    pid: Pid,
    registry: Mutex<WaiterRegistry>,
    stdin: Option<Arc<InputInner>>,
    stdout: Option<Arc<OutputInner>>,
    stderr: Option<Arc<OutputInner>>,
}

impl ProcessShared {
    pub(crate) fn new(
        pid: Pid,
        stdin: Option<Arc<InputInner>>,
        stdout: Option<Arc<OutputInner>>,
        stderr: Option<Arc<OutputInner>>,
    ) -> Self {
        Self {
            pid,
            registry: Mutex::new(WaiterRegistry::default()),
            stdin,
            stdout,
            stderr,
        }
    }

    pub(crate) fn pid(&self) -> Pid {
        self.pid
    }

    pub(crate) fn status(&self) -> Option<ExitStatus> {
        self.registry.lock().unwrap().status
    }

    /// Record the child's termination. Called exactly once, by the watcher.
    ///
    /// Ordering: freeze the status, close stdin, request drain-aware closes
    /// on the output streams, then wake every registered waiter. Stream
    /// close errors are swallowed on this path.
    pub(crate) fn complete(&self, status: ExitStatus) {
        let woken = {
            let mut registry = self.registry.lock().unwrap();
            debug_assert!(registry.status.is_none(), "child terminated twice");
            if registry.status.is_some() {
                return;
            }
            registry.status = Some(status);
            std::mem::take(&mut registry.waiters)
        };

        if let Some(stdin) = &self.stdin {
            stdin.close_quiet();
        }
        if let Some(stdout) = &self.stdout {
            stdout.close_when_drained();
        }
        if let Some(stderr) = &self.stderr {
            stderr.close_when_drained();
        }

        debug!(pid = %self.pid, status = %status, waiters = woken.len(), "resuming waiters");
        for (_, waker) in woken {
            waker.wake();
        }
    }

    /// Wait for termination; the fast path returns the frozen status.
    pub(crate) async fn wait(&self) -> ExitStatus {
        WaitFuture {
            shared: self,
            waiter_id: None,
        }
        .await
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        self.registry.lock().unwrap().waiters.len()
    }
}

/// One registered waiter for child termination.
///
/// `poll` installs or refreshes the waker under the coordinator lock; `Drop`
/// removes the registration under the same lock. Because poll and drop of a
/// single future cannot race, a waiter is removed from the registry exactly
/// once: either by the termination fan-out or by its own drop.
struct WaitFuture<'a> {
    shared: &'a ProcessShared,
    waiter_id: Option<u64>,
}

impl Future for WaitFuture<'_> {
    type Output = ExitStatus;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<ExitStatus> {
        let this = self.get_mut();
        let mut registry = this.shared.registry.lock().unwrap();

        if let Some(status) = registry.status {
            // Terminated before (or while) this waiter was registered; the
            // fan-out already emptied the registry, so just forget the id.
            this.waiter_id = None;
            return Poll::Ready(status);
        }

        match this.waiter_id {
            Some(id) => {
                registry.waiters.insert(id, cx.waker().clone());
            }
            None => {
                let id = registry.next_waiter_id;
                registry.next_waiter_id += 1;
                registry.waiters.insert(id, cx.waker().clone());
                this.waiter_id = Some(id);
            }
        }
        Poll::Pending
    }
}

impl Drop for WaitFuture<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.waiter_id {
            self.shared.registry.lock().unwrap().waiters.remove(&id);
        }
    }
}

/// Collected output of [`Subprocess::wait_with_output`].
#[derive(Debug)]
pub struct Output {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Handle to a spawned child process.
///
/// The handle borrows out its streams (`stdin()`, `stdout()`, `stderr()`)
/// rather than giving them away, because the termination path also needs
/// them: when the watcher reports, stdin is closed and the output streams
/// are closed once their in-flight reads drain.
#[derive(Debug)]
pub struct Subprocess {
    shared: Arc<ProcessShared>,
    stdin: Option<InputStream>,
    stdout: Option<OutputStream>,
    stderr: Option<OutputStream>,
}

impl Subprocess {
    pub(crate) fn new(
        shared: Arc<ProcessShared>,
        stdin: Option<InputStream>,
        stdout: Option<OutputStream>,
        stderr: Option<OutputStream>,
    ) -> Self {
        Self {
            shared,
            stdin,
            stdout,
            stderr,
        }
    }

    /// The child's OS process ID.
    pub fn pid(&self) -> u32 {
        self.shared.pid.as_raw() as u32
    }

    /// The child's stdin stream, if it was configured as a pipe.
    pub fn stdin(&self) -> Option<&InputStream> {
        self.stdin.as_ref()
    }

    /// The child's stdout stream, if it was configured as a pipe.
    pub fn stdout(&self) -> Option<&OutputStream> {
        self.stdout.as_ref()
    }

    /// The child's stderr stream, if it was configured as a pipe.
    pub fn stderr(&self) -> Option<&OutputStream> {
        self.stderr.as_ref()
    }

    /// Snapshot of the exit status, if the child has terminated.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.shared.status()
    }

    /// Whether the child has not yet been observed to terminate.
    pub fn is_running(&self) -> bool {
        self.shared.status().is_none()
    }

    /// Send a signal to the child.
    ///
    /// Returns `false` without issuing the syscall when the child has
    /// already terminated, and `false` on `ESRCH` (the delivery raced the
    /// watcher's reap). Other errnos surface as
    /// [`ProcessError::Signal`].
    pub fn send_signal(&self, signal: Signal) -> Result<bool> {
        if self.shared.status().is_some() {
            return Ok(false);
        }
        match signal::kill(self.shared.pid, signal) {
            Ok(()) => {
                debug!(pid = %self.shared.pid, signal = %signal, "signal delivered");
                Ok(true)
            }
            Err(Errno::ESRCH) => {
                debug!(pid = %self.shared.pid, "signal raced termination");
                Ok(false)
            }
            Err(errno) => Err(ProcessError::Signal {
                signal,
                pid: self.shared.pid.as_raw(),
                errno,
            }),
        }
    }

    /// Request graceful termination (`SIGTERM`).
    pub fn terminate(&self) -> Result<bool> {
        self.send_signal(Signal::SIGTERM)
    }

    /// Force termination (`SIGKILL`).
    pub fn kill(&self) -> Result<bool> {
        self.send_signal(Signal::SIGKILL)
    }

    /// Wait until the child terminates.
    ///
    /// Every concurrent and subsequent waiter observes the same frozen
    /// status. Cancel-safe: dropping the future deregisters the waiter.
    pub async fn wait(&self) -> ExitStatus {
        self.shared.wait().await
    }

    /// Drain stdout and stderr while waiting for termination.
    ///
    /// The drainers and the wait are driven concurrently, with the drainers
    /// scheduled first — waiting without draining could deadlock on a full
    /// pipe buffer. A stream closed underneath its drainer yields empty
    /// bytes. With `collect_*` false the stream is still drained to EOF but
    /// the data is dropped.
    pub async fn wait_with_output(
        &self,
        collect_stdout: bool,
        collect_stderr: bool,
    ) -> Result<Output> {
        let (stdout, stderr, status) = tokio::join!(
            drain_stream(self.stdout.as_ref(), collect_stdout),
            drain_stream(self.stderr.as_ref(), collect_stderr),
            self.wait(),
        );
        Ok(Output {
            status,
            stdout: stdout?,
            stderr: stderr?,
        })
    }

    /// Run `body`, then terminate the child and wait for it to be reaped.
    ///
    /// The signal is delivered and the termination awaited no matter how
    /// `body` ends. If this future itself is dropped mid-flight, a guard
    /// still delivers the signal synchronously; the watcher thread reaps
    /// the child in the background.
    pub async fn terminate_after<F>(&self, signal: Signal, body: F) -> F::Output
    where
        F: Future,
    {
        let mut guard = SignalOnDrop {
            shared: Arc::clone(&self.shared),
            signal,
            armed: true,
        };

        let output = body.await;

        // The signal is sent on the normal path now; disarm so the guard
        // does not double-deliver if the wait below is cancelled.
        guard.armed = false;
        if let Err(e) = self.send_signal(signal) {
            warn!(pid = %self.shared.pid, error = %e, "scoped termination signal failed");
        }
        self.wait().await;
        output
    }
}

/// Delivers the scoped-termination signal if the combinator future is
/// dropped before its cleanup ran.
struct SignalOnDrop {
    shared: Arc<ProcessShared>,
    signal: Signal,
    armed: bool,
}

impl Drop for SignalOnDrop {
    fn drop(&mut self) {
        if self.armed && self.shared.status().is_none() {
            let _ = signal::kill(self.shared.pid, self.signal);
        }
    }
}

async fn drain_stream(stream: Option<&OutputStream>, collect: bool) -> Result<Vec<u8>> {
    match stream {
        None => Ok(Vec::new()),
        Some(stream) if collect => stream.read_to_end().await,
        Some(stream) => {
            stream.discard().await?;
            Ok(Vec::new())
        }
    }
}

/// Builder for spawning a child process.
///
/// No PATH search is performed: `program` is used as given, absolute or
/// relative to the parent's working directory.
///
/// # Example
///
/// ```rust,no_run
/// use procyon::{Command, StdinConfig, OutputConfig};
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let child = Command::new("/bin/cat")
///     .stdin(StdinConfig::pipe())
///     .stdout(OutputConfig::pipe())
///     .spawn()?;
///
/// child.stdin().unwrap().write_str("hello\n").await?;
/// child.stdin().unwrap().close()?;
/// let output = child.wait_with_output(true, false).await?;
/// assert_eq!(output.stdout, b"hello\n");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Command {
    pub(crate) program: PathBuf,
    pub(crate) args: Vec<OsString>,
    pub(crate) arg0: Option<OsString>,
    pub(crate) env: Env,
    pub(crate) stdin: StdinConfig,
    pub(crate) stdout: OutputConfig,
    pub(crate) stderr: OutputConfig,
}

impl Command {
    /// Start building a spawn of `program`.
    ///
    /// Defaults: stdin from `/dev/null`, stdout and stderr discarded, the
    /// parent environment inherited unchanged.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            arg0: None,
            env: Env::default(),
            stdin: StdinConfig::default(),
            stdout: OutputConfig::default(),
            stderr: OutputConfig::default(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Use a distinct `argv[0]` instead of duplicating the program path.
    pub fn arg0(mut self, arg0: impl Into<OsString>) -> Self {
        self.arg0 = Some(arg0.into());
        self
    }

    /// Add an environment entry: an override on top of the inherited
    /// environment, or an entry of the replacement set after
    /// [`env_clear`](Self::env_clear).
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push(key.into(), value.into());
        self
    }

    /// Stop inheriting: the child sees only entries added after this call.
    pub fn env_clear(mut self) -> Self {
        self.env = Env::Custom(Vec::new());
        self
    }

    /// Configure the child's stdin.
    pub fn stdin(mut self, config: StdinConfig) -> Self {
        self.stdin = config;
        self
    }

    /// Configure the child's stdout.
    pub fn stdout(mut self, config: OutputConfig) -> Self {
        self.stdout = config;
        self
    }

    /// Configure the child's stderr.
    pub fn stderr(mut self, config: OutputConfig) -> Self {
        self.stderr = config;
        self
    }

    /// Spawn the child.
    pub fn spawn(&self) -> std::result::Result<Subprocess, SpawnError> {
        init::spawn(self)
    }
}
