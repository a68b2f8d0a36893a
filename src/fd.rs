//! Owning file-descriptor handle with idempotent close
//!
//! Every descriptor the library touches is owned by exactly one [`FdHandle`].
//! The handle guarantees that at most one `close` ever reaches the OS, no
//! matter how many times `close()` is called or whether the handle is dropped
//! afterwards. This is the foundation for the crate-wide "no descriptor is
//! closed twice, no descriptor leaks" invariant: double closes are absorbed
//! here, and `Drop` is the backstop for error-path unwinding.

use std::os::fd::{IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

use nix::errno::Errno;

use crate::error::ProcessError;

/// Sentinel stored in place of the descriptor once the handle is closed.
const CLOSED: RawFd = -1;

/// An owning wrapper around a raw file descriptor.
///
/// The descriptor is held in an atomic so that a close racing an access from
/// another thread (the termination watcher closing a stream a reader still
/// holds) resolves to either "got the descriptor" or `Closed`, never to a
/// close reaching the OS twice.
#[derive(Debug)]
pub struct FdHandle {
    fd: AtomicI32,
}

impl FdHandle {
    /// Take ownership of a raw descriptor.
    pub fn from_raw(fd: RawFd) -> Self {
        debug_assert!(fd >= 0, "FdHandle requires a valid descriptor");
        Self {
            fd: AtomicI32::new(fd),
        }
    }

    /// Take ownership of an [`OwnedFd`], disabling its own close-on-drop.
    pub fn from_owned(fd: OwnedFd) -> Self {
        Self::from_raw(fd.into_raw_fd())
    }

    /// Get the underlying descriptor.
    ///
    /// Fails with [`ProcessError::Closed`] once the handle has been closed.
    pub fn get(&self) -> Result<RawFd, ProcessError> {
        match self.fd.load(Ordering::Acquire) {
            CLOSED => Err(ProcessError::Closed),
            fd => Ok(fd),
        }
    }

    /// Whether the handle has been closed.
    pub fn is_closed(&self) -> bool {
        self.fd.load(Ordering::Acquire) == CLOSED
    }

    /// Close the descriptor.
    ///
    /// Idempotent: only the first call reaches the OS, and the handle is
    /// marked closed *before* the OS call so that a failing close cannot be
    /// retried. Errors from that first OS close propagate to the caller;
    /// subsequent calls return `Ok(())`.
    pub fn close(&self) -> Result<(), ProcessError> {
        let fd = self.fd.swap(CLOSED, Ordering::AcqRel);
        if fd == CLOSED {
            return Ok(());
        }
        close_raw(fd).map_err(ProcessError::Close)
    }
}

impl Drop for FdHandle {
    fn drop(&mut self) {
        let fd = self.fd.swap(CLOSED, Ordering::AcqRel);
        if fd != CLOSED {
            // Unwind path: the error has nowhere useful to go.
            let _ = close_raw(fd);
        }
    }
}

fn close_raw(fd: RawFd) -> Result<(), Errno> {
    // SAFETY: fd was owned by this handle and has been swapped out, so no
    // other caller can observe or close it again.
    let rc = unsafe { libc::close(fd) };
    if rc == -1 {
        Err(Errno::last())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pipe() -> (FdHandle, FdHandle) {
        let (r, w) = nix::unistd::pipe().expect("Failed to create pipe");
        (FdHandle::from_owned(r), FdHandle::from_owned(w))
    }

    #[test]
    fn test_get_returns_descriptor() {
        let (r, _w) = test_pipe();
        let fd = r.get().expect("Failed to get descriptor");
        assert!(fd >= 0);
        assert!(!r.is_closed());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (r, w) = test_pipe();
        r.close().expect("First close failed");
        // Second and third closes are absorbed without touching the OS.
        r.close().expect("Second close failed");
        r.close().expect("Third close failed");
        assert!(r.is_closed());
        w.close().expect("Failed to close write end");
    }

    #[test]
    fn test_get_after_close_fails() {
        let (r, w) = test_pipe();
        r.close().expect("Failed to close");
        assert!(matches!(r.get(), Err(ProcessError::Closed)));
        w.close().expect("Failed to close write end");
    }

    #[test]
    fn test_drop_closes_the_descriptor() {
        let (r, w) = test_pipe();
        drop(w);

        // The write end was closed by the drop, so the read end sees EOF.
        let mut buf = [0u8; 4];
        let n = unsafe {
            libc::read(
                r.get().unwrap(),
                buf.as_mut_ptr().cast::<libc::c_void>(),
                buf.len(),
            )
        };
        assert_eq!(n, 0);
    }

    #[test]
    fn test_close_after_manual_close_reports_nothing() {
        let (r, w) = test_pipe();
        w.close().expect("Failed to close write end");
        drop(w);
        r.close().expect("Failed to close read end");
    }
}
