//! Signal-safe fork/exec engine
//!
//! Spawning is a two-phase protocol built around a *sync pipe*: an anonymous
//! pipe whose write end the child marks close-on-exec. A successful `execve`
//! closes that end in the kernel, so the parent reading EOF knows the child
//! is running the target program. Any child-side failure before `execve`
//! writes an `(opcode, errno)` pair to the pipe and exits with 127, letting
//! the parent classify exactly which step broke.
//!
//! ## The child arm
//!
//! Between `fork` and `execve` the child runs with only async-signal-safe
//! primitives: raw `libc` calls, no allocation, no locking, no formatting.
//! All argv/env marshalling therefore happens *before* the fork, in
//! [`crate::config`]. The child redirects the three supplied descriptors
//! onto fds 0/1/2, sweeps every other descriptor closed, resets all signal
//! dispositions, unblocks all signals, and execs.

#![allow(unsafe_code)]

use std::ffi::{CStr, CString};
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, RawFd};
use std::ptr;

use libc::c_int;
use nix::errno::Errno;
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult, Pid};
use thiserror::Error;
use tracing::debug;

/// Opcodes reported over the sync pipe by a failing child.
///
/// The values double as the parent-side classification sentinels, matching
/// the wire protocol: two native-width integers `(opcode, errno)`.
const CHILD_ERR_DUP2: c_int = -4;
const CHILD_ERR_PIPE_CLOEXEC: c_int = -5;
const CHILD_ERR_EXEC: c_int = -6;

/// Size of one `(opcode, errno)` message on the sync pipe.
const ERR_MESSAGE_SIZE: usize = 2 * std::mem::size_of::<c_int>();

/// Classified spawn failures, each carrying the errno observed at the
/// failing step.
#[derive(Error, Debug)]
pub(crate) enum ForkExecError {
    #[error("failed to open the sync pipe: {0}")]
    PipeOpen(#[source] Errno),

    #[error("fork failed: {0}")]
    Fork(#[source] Errno),

    #[error("failed to read the sync pipe: {0}")]
    PipeRead(#[source] Errno),

    #[error("child failed to redirect a standard stream: {0}")]
    ChildDup2(#[source] Errno),

    #[error("child failed to mark the sync pipe close-on-exec: {0}")]
    ChildCloexec(#[source] Errno),

    #[error("child failed to exec: {0}")]
    ChildExec(#[source] Errno),
}

/// The three descriptors to install as the child's standard streams.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChildStdio {
    pub stdin: RawFd,
    pub stdout: RawFd,
    pub stderr: RawFd,
}

/// Fork and exec `program` with the given argument and environment blocks.
///
/// Returns the child pid once the parent has confirmed, via the sync pipe,
/// that `execve` was reached. On any classified failure the child has
/// already been reaped (or never existed) when this returns.
pub(crate) fn fork_exec(
    program: &CStr,
    argv: &[CString],
    envp: &[CString],
    stdio: ChildStdio,
) -> Result<Pid, ForkExecError> {
    // Pointer vectors must exist before the fork: the child may not allocate.
    let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|a| a.as_ptr()).collect();
    argv_ptrs.push(ptr::null());
    let mut envp_ptrs: Vec<*const libc::c_char> = envp.iter().map(|e| e.as_ptr()).collect();
    envp_ptrs.push(ptr::null());

    let (sync_read, sync_write) = nix::unistd::pipe().map_err(ForkExecError::PipeOpen)?;
    let sync_read_fd = sync_read.as_raw_fd();
    let sync_write_fd = sync_write.as_raw_fd();

    // SAFETY: the child arm below calls only async-signal-safe primitives
    // until execve or _exit.
    match unsafe { fork() }.map_err(ForkExecError::Fork)? {
        ForkResult::Parent { child } => {
            drop(sync_write);
            let result = read_child_report(sync_read_fd, child);
            drop(sync_read);
            if let Err(ref e) = result {
                debug!(pid = %child, error = %e, "reaping child after failed spawn");
                while let Err(Errno::EINTR) = waitpid(child, None) {}
            }
            result
        }
        ForkResult::Child => {
            // SAFETY: single-threaded child address space; raw descriptors
            // stay valid because no drop glue runs before execve/_exit.
            unsafe { child_arm(program, &argv_ptrs, &envp_ptrs, stdio, sync_read_fd, sync_write_fd) }
        }
    }
}

/// Parent side of the sync-pipe protocol.
fn read_child_report(sync_read: RawFd, child: Pid) -> Result<Pid, ForkExecError> {
    let mut message = [0 as c_int; 2];
    loop {
        // SAFETY: reading into a local buffer from a descriptor this
        // function owns for the duration of the call.
        let n = unsafe {
            libc::read(
                sync_read,
                message.as_mut_ptr().cast::<libc::c_void>(),
                ERR_MESSAGE_SIZE,
            )
        };
        if n == 0 {
            // The kernel closed the write end on exec: the child is running.
            return Ok(child);
        }
        if n == ERR_MESSAGE_SIZE as isize {
            let errno = Errno::from_raw(message[1]);
            return Err(match message[0] {
                CHILD_ERR_DUP2 => ForkExecError::ChildDup2(errno),
                CHILD_ERR_PIPE_CLOEXEC => ForkExecError::ChildCloexec(errno),
                CHILD_ERR_EXEC => ForkExecError::ChildExec(errno),
                _ => ForkExecError::PipeRead(Errno::EDOM),
            });
        }
        if n < 0 {
            match Errno::last() {
                Errno::EINTR | Errno::EAGAIN => continue,
                e => return Err(ForkExecError::PipeRead(e)),
            }
        }
        // Partial message: the protocol only ever writes whole pairs.
        return Err(ForkExecError::PipeRead(Errno::EDOM));
    }
}

/// Child side: redirect stdio, sweep descriptors, reset signals, exec.
///
/// # Safety
///
/// Must only be called in the child of a `fork`, where this process owns the
/// address space alone and every call below is async-signal-safe.
unsafe fn child_arm(
    program: &CStr,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
    stdio: ChildStdio,
    sync_read: RawFd,
    sync_write: RawFd,
) -> ! {
    libc::close(sync_read);

    if libc::dup2(stdio.stdin, libc::STDIN_FILENO) == -1 {
        report_and_exit(sync_write, CHILD_ERR_DUP2, Errno::last_raw());
    }
    if libc::dup2(stdio.stdout, libc::STDOUT_FILENO) == -1 {
        report_and_exit(sync_write, CHILD_ERR_DUP2, Errno::last_raw());
    }
    if libc::dup2(stdio.stderr, libc::STDERR_FILENO) == -1 {
        report_and_exit(sync_write, CHILD_ERR_DUP2, Errno::last_raw());
    }

    if stdio.stdin > libc::STDERR_FILENO {
        libc::close(stdio.stdin);
    }
    if stdio.stdout > libc::STDERR_FILENO {
        libc::close(stdio.stdout);
    }
    if stdio.stderr > libc::STDERR_FILENO {
        libc::close(stdio.stderr);
    }

    // Sweep every inherited descriptor except the sync pipe's write end.
    let max_fd = match libc::sysconf(libc::_SC_OPEN_MAX) {
        -1 => 1024,
        n => n as c_int,
    };
    for fd in (libc::STDERR_FILENO + 1)..=max_fd {
        if fd != sync_write {
            libc::close(fd);
        }
    }

    // A successful execve closes the sync pipe, signalling EOF to the parent.
    if libc::fcntl(sync_write, libc::F_SETFD, libc::FD_CLOEXEC) == -1 {
        report_and_exit(sync_write, CHILD_ERR_PIPE_CLOEXEC, Errno::last_raw());
    }

    // SIGKILL and SIGSTOP reject SIG_DFL; the error is irrelevant.
    for sig in 1..32 {
        libc::signal(sig, libc::SIG_DFL);
    }
    let mut all_signals = MaybeUninit::<libc::sigset_t>::uninit();
    libc::sigfillset(all_signals.as_mut_ptr());
    libc::sigprocmask(libc::SIG_UNBLOCK, all_signals.as_ptr(), ptr::null_mut());

    libc::execve(program.as_ptr(), argv.as_ptr(), envp.as_ptr());

    report_and_exit(sync_write, CHILD_ERR_EXEC, Errno::last_raw());
}

/// Write `(opcode, errno)` to the sync pipe and `_exit(127)`.
///
/// # Safety
///
/// Child-arm only; see [`child_arm`].
unsafe fn report_and_exit(sync_write: RawFd, opcode: c_int, errno: i32) -> ! {
    let message = [opcode, errno];
    libc::write(
        sync_write,
        message.as_ptr().cast::<libc::c_void>(),
        ERR_MESSAGE_SIZE,
    );
    libc::_exit(127);
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::WaitStatus;

    fn null_stdio() -> (std::fs::File, ChildStdio) {
        let null = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/null")
            .expect("Failed to open /dev/null");
        let fd = null.as_raw_fd();
        (
            null,
            ChildStdio {
                stdin: fd,
                stdout: fd,
                stderr: fd,
            },
        )
    }

    fn cstr(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    #[test]
    fn test_successful_exec_returns_pid() {
        let (_null, stdio) = null_stdio();
        let program = cstr("/bin/true");
        let argv = vec![cstr("/bin/true")];
        let pid = fork_exec(&program, &argv, &[], stdio).expect("Failed to spawn /bin/true");
        assert!(pid.as_raw() > 0);

        match waitpid(pid, None).expect("Failed to wait") {
            WaitStatus::Exited(_, code) => assert_eq!(code, 0),
            other => panic!("Unexpected wait status: {:?}", other),
        }
    }

    #[test]
    fn test_missing_executable_reports_exec_stage() {
        let (_null, stdio) = null_stdio();
        let program = cstr("/usr/bin/404_not_found");
        let argv = vec![cstr("/usr/bin/404_not_found")];
        match fork_exec(&program, &argv, &[], stdio) {
            Err(ForkExecError::ChildExec(Errno::ENOENT)) => {}
            other => panic!("Expected ChildExec(ENOENT), got: {:?}", other),
        }
        // The failed child was reaped inside fork_exec; nothing to clean up.
    }

    #[test]
    fn test_non_executable_file_reports_exec_stage() {
        let path = "/tmp/procyon_test_not_executable";
        std::fs::write(path, b"not a program").expect("Failed to write fixture");

        let (_null, stdio) = null_stdio();
        let program = cstr(path);
        let argv = vec![cstr(path)];
        let result = fork_exec(&program, &argv, &[], stdio);
        let _ = std::fs::remove_file(path);
        match result {
            Err(ForkExecError::ChildExec(Errno::EACCES)) => {}
            other => panic!("Expected ChildExec(EACCES), got: {:?}", other),
        }
    }

    #[test]
    fn test_bad_stdio_descriptor_reports_dup2_stage() {
        let stdio = ChildStdio {
            stdin: 741_321,
            stdout: 741_321,
            stderr: 741_321,
        };
        let program = cstr("/bin/true");
        let argv = vec![cstr("/bin/true")];
        match fork_exec(&program, &argv, &[], stdio) {
            Err(ForkExecError::ChildDup2(Errno::EBADF)) => {}
            other => panic!("Expected ChildDup2(EBADF), got: {:?}", other),
        }
    }
}
