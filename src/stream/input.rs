//! Writer side of the child's stdin pipe

use std::sync::Arc;

use nix::errno::Errno;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::error::{ProcessError, Result};
use crate::fd::FdHandle;

/// Shared state behind an [`InputStream`].
///
/// The coordinator keeps its own `Arc` so the termination callback can close
/// stdin without going through the public handle.
#[derive(Debug)]
pub(crate) struct InputInner {
    fd: FdHandle,
    /// Serialises caller operations: exactly one concurrent caller is ever
    /// inside the stream.
    op: tokio::sync::Mutex<()>,
}

impl InputInner {
    pub(crate) fn new(fd: FdHandle) -> Arc<Self> {
        Arc::new(Self {
            fd,
            op: tokio::sync::Mutex::new(()),
        })
    }

    /// Close without reporting: the termination path has no use for errors.
    pub(crate) fn close_quiet(&self) {
        let _ = self.fd.close();
    }

    /// One non-blocking write syscall.
    fn write_once(&self, buf: &[u8]) -> Result<Option<usize>> {
        let fd = self.fd.get()?;
        loop {
            // SAFETY: fd is owned by this stream's FdHandle and buf is a
            // valid slice for the duration of the call.
            let n = unsafe { libc::write(fd, buf.as_ptr().cast::<libc::c_void>(), buf.len()) };
            if n >= 0 {
                return Ok(Some(n as usize));
            }
            match Errno::last() {
                Errno::EINTR => continue,
                e if e == Errno::EAGAIN || e == Errno::EWOULDBLOCK => return Ok(None),
                e => return Err(ProcessError::Write(e)),
            }
        }
    }
}

/// Write half of the child's stdin, backed by a non-blocking pipe.
///
/// Writes up to `PIPE_BUF` bytes are atomic; larger writes may be partial
/// and surface as a short count. Callers that need whole-message atomicity
/// must chunk accordingly.
#[derive(Debug)]
pub struct InputStream {
    inner: Arc<InputInner>,
}

impl InputStream {
    pub(crate) fn new(inner: Arc<InputInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<InputInner> {
        &self.inner
    }

    /// Write as many bytes as the pipe will accept.
    ///
    /// Returns `None` iff the pipe is full and the write would block;
    /// otherwise the number of bytes accepted (possibly short for writes
    /// larger than `PIPE_BUF`). Fails with [`ProcessError::Closed`] once the
    /// stream is closed.
    pub async fn write(&self, buf: &[u8]) -> Result<Option<usize>> {
        let _op = self.inner.op.lock().await;
        self.inner.write_once(buf)
    }

    /// Drain an async byte source into memory, then write it in one call.
    ///
    /// Same result semantics as [`write`](Self::write): the whole buffered
    /// sequence is handed to a single syscall.
    pub async fn write_from<R>(&self, mut src: R) -> Result<Option<usize>>
    where
        R: AsyncRead + Unpin,
    {
        let mut data = Vec::new();
        src.read_to_end(&mut data).await?;
        debug!(bytes = data.len(), "buffered input source");
        let _op = self.inner.op.lock().await;
        self.inner.write_once(&data)
    }

    /// Write the UTF-8 bytes of a string.
    pub async fn write_str(&self, text: &str) -> Result<Option<usize>> {
        self.write(text.as_bytes()).await
    }

    /// Close the write end. Idempotent; the first call's OS error surfaces.
    pub fn close(&self) -> Result<()> {
        self.inner.fd.close()
    }

    /// Whether the stream has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.fd.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe;

    fn nonblocking_input() -> (FdHandle, InputStream) {
        let (read_end, write_end) = pipe::create().expect("Failed to create pipe");
        pipe::set_nonblocking(write_end.get().unwrap()).expect("Failed to set O_NONBLOCK");
        (read_end, InputStream::new(InputInner::new(write_end)))
    }

    fn read_exact(fd: &FdHandle, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        let n = unsafe {
            libc::read(
                fd.get().unwrap(),
                buf.as_mut_ptr().cast::<libc::c_void>(),
                len,
            )
        };
        assert!(n >= 0);
        buf.truncate(n as usize);
        buf
    }

    #[tokio::test]
    async fn test_write_small_buffer_is_complete() {
        let (read_end, input) = nonblocking_input();
        let written = input.write(b"hello").await.expect("Failed to write");
        assert_eq!(written, Some(5));
        assert_eq!(read_exact(&read_end, 16), b"hello");
    }

    #[tokio::test]
    async fn test_write_full_pipe_returns_none() {
        let (_read_end, input) = nonblocking_input();
        let chunk = vec![0u8; 65536];
        // Fill the kernel buffer until the write would block.
        loop {
            match input.write(&chunk).await.expect("Failed to write") {
                Some(_) => continue,
                None => break,
            }
        }
    }

    #[tokio::test]
    async fn test_write_str_round_trips_bytes() {
        let (read_end, input) = nonblocking_input();
        let written = input.write_str("1\n2\n3").await.expect("Failed to write");
        assert_eq!(written, Some(5));
        assert_eq!(read_exact(&read_end, 16), b"1\n2\n3");
    }

    #[tokio::test]
    async fn test_write_from_buffers_then_writes() {
        let (read_end, input) = nonblocking_input();
        let src: &[u8] = b"buffered source";
        let written = input.write_from(src).await.expect("Failed to write");
        assert_eq!(written, Some(15));
        assert_eq!(read_exact(&read_end, 32), b"buffered source");
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_poisons_writes() {
        let (_read_end, input) = nonblocking_input();
        input.close().expect("First close failed");
        input.close().expect("Second close failed");
        assert!(input.is_closed());
        assert!(matches!(
            input.write(b"x").await,
            Err(ProcessError::Closed)
        ));
    }
}
