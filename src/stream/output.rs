//! Reader side of the child's stdout/stderr pipes
//!
//! Bulk reads poll: the pipe is non-blocking, and `EAGAIN` turns into a
//! short sleep rather than a reactor registration. Termination must not
//! break a reader mid-drain, so closing from the termination path is
//! *deferred*: while reads are in flight the close request is parked as a
//! flag, and the last read to finish performs the actual close.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::errno::Errno;
use tracing::debug;

use crate::error::{ProcessError, Result};
use crate::fd::FdHandle;

/// Staging buffer for bulk reads.
const STAGING_BUFFER_SIZE: usize = 1024;

/// Sleep between polls when the pipe is empty but not at EOF.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct DrainState {
    /// Number of bulk reads currently inside the stream.
    pending_reads: u32,
    /// A termination-path close arrived while reads were in flight.
    close_when_drained: bool,
}

/// Shared state behind an [`OutputStream`].
#[derive(Debug)]
pub(crate) struct OutputInner {
    fd: FdHandle,
    /// Serialises caller operations: exactly one concurrent caller is ever
    /// inside the stream.
    op: tokio::sync::Mutex<()>,
    drain: Mutex<DrainState>,
}

impl OutputInner {
    pub(crate) fn new(fd: FdHandle) -> Arc<Self> {
        Arc::new(Self {
            fd,
            op: tokio::sync::Mutex::new(()),
            drain: Mutex::new(DrainState::default()),
        })
    }

    /// One non-blocking read syscall. `Some(0)` is EOF, `None` would block.
    fn read_once(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        let fd = self.fd.get()?;
        loop {
            // SAFETY: fd is owned by this stream's FdHandle and buf is a
            // valid slice for the duration of the call.
            let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast::<libc::c_void>(), buf.len()) };
            if n >= 0 {
                return Ok(Some(n as usize));
            }
            match Errno::last() {
                Errno::EINTR => continue,
                e if e == Errno::EAGAIN || e == Errno::EWOULDBLOCK => return Ok(None),
                e => return Err(ProcessError::Read(e)),
            }
        }
    }

    /// Close now, or after the last in-flight read if any are pending.
    ///
    /// Called from the termination path; close errors are swallowed there
    /// because the child is already gone.
    pub(crate) fn close_when_drained(&self) {
        let defer = {
            let mut state = self.drain.lock().unwrap();
            if state.pending_reads > 0 {
                state.close_when_drained = true;
                true
            } else {
                false
            }
        };
        if defer {
            debug!("deferring stream close until in-flight reads finish");
        } else {
            let _ = self.fd.close();
        }
    }
}

/// Tracks one in-flight bulk read.
///
/// Dropping the guard — on completion, error, or cancellation of the read
/// future — decrements the pending-read counter, and the drop that reaches
/// zero performs a parked close. A deferred close can therefore never be
/// lost to a cancelled read.
struct DrainGuard<'a> {
    inner: &'a OutputInner,
}

impl<'a> DrainGuard<'a> {
    fn enter(inner: &'a OutputInner) -> Self {
        inner.drain.lock().unwrap().pending_reads += 1;
        Self { inner }
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        let close_now = {
            let mut state = self.inner.drain.lock().unwrap();
            state.pending_reads -= 1;
            state.pending_reads == 0 && state.close_when_drained
        };
        if close_now {
            let _ = self.inner.fd.close();
        }
    }
}

/// Read half of a child output pipe.
#[derive(Debug)]
pub struct OutputStream {
    inner: Arc<OutputInner>,
}

impl OutputStream {
    pub(crate) fn new(inner: Arc<OutputInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<OutputInner> {
        &self.inner
    }

    /// One non-blocking read into `buf`.
    ///
    /// Returns `Some(0)` at end-of-file (every write end closed), a positive
    /// count when data was available, and `None` when the read would block.
    pub async fn read(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        let _op = self.inner.op.lock().await;
        self.inner.read_once(buf)
    }

    /// Accumulate everything the child writes until end-of-file.
    ///
    /// The stream being closed underneath (by the termination path) counts
    /// as end-of-file: whatever was collected up to that point is returned.
    pub async fn read_to_end(&self) -> Result<Vec<u8>> {
        let _op = self.inner.op.lock().await;
        let _read = DrainGuard::enter(&self.inner);

        let mut collected = Vec::new();
        let mut staging = [0u8; STAGING_BUFFER_SIZE];
        loop {
            match self.inner.read_once(&mut staging) {
                Ok(Some(0)) => break,
                Ok(Some(n)) => collected.extend_from_slice(&staging[..n]),
                Ok(None) => tokio::time::sleep(POLL_INTERVAL).await,
                Err(ProcessError::Closed) | Err(ProcessError::Read(Errno::EBADF)) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(collected)
    }

    /// [`read_to_end`](Self::read_to_end), decoded as UTF-8.
    pub async fn read_to_string(&self) -> Result<String> {
        let bytes = self.read_to_end().await?;
        String::from_utf8(bytes).map_err(ProcessError::Decode)
    }

    /// Drain the stream to end-of-file, dropping the data.
    pub async fn discard(&self) -> Result<()> {
        let _op = self.inner.op.lock().await;
        let _read = DrainGuard::enter(&self.inner);

        let mut staging = [0u8; STAGING_BUFFER_SIZE];
        loop {
            match self.inner.read_once(&mut staging) {
                Ok(Some(0)) => break,
                Ok(Some(_)) => {}
                Ok(None) => tokio::time::sleep(POLL_INTERVAL).await,
                Err(ProcessError::Closed) | Err(ProcessError::Read(Errno::EBADF)) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Close the read end immediately. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.inner.fd.close()
    }

    /// Whether the stream has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.fd.is_closed()
    }
}
