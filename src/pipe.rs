//! Pipe creation and descriptor configuration
//!
//! The parent-visible end of every stream pipe is switched to non-blocking
//! mode so stream operations can map `EAGAIN` to a poll-again result instead
//! of stalling the runtime. Buffer size hints are Linux-only and best-effort.

use std::os::fd::RawFd;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};

use crate::fd::FdHandle;

/// Create an anonymous pipe, returning `(read_end, write_end)`.
pub(crate) fn create() -> nix::Result<(FdHandle, FdHandle)> {
    let (read_end, write_end) = nix::unistd::pipe()?;
    Ok((FdHandle::from_owned(read_end), FdHandle::from_owned(write_end)))
}

/// Set `O_NONBLOCK` on a descriptor.
///
/// The flags are written back only when the bit was not already set.
pub(crate) fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    if !flags.contains(OFlag::O_NONBLOCK) {
        fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    }
    Ok(())
}

/// Apply a pipe buffer size hint.
///
/// On Linux this issues `F_SETPIPE_SZ`. `EBUSY` means the kernel already
/// holds at least the requested capacity and is swallowed. On other systems
/// the hint is a no-op.
#[cfg(target_os = "linux")]
pub(crate) fn set_buffer_size(fd: RawFd, bytes: usize) -> nix::Result<()> {
    match fcntl(fd, FcntlArg::F_SETPIPE_SZ(bytes as libc::c_int)) {
        Ok(_) => Ok(()),
        Err(Errno::EBUSY) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_buffer_size(_fd: RawFd, _bytes: usize) -> nix::Result<()> {
    Ok(())
}
