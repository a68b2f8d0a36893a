//! Initialization pipeline: descriptors, watcher, fork/exec, unwind
//!
//! Descriptor ownership during spawn falls in two sets. *Close-after-spawn*
//! holds the child-side pipe ends, caller descriptors marked for closing,
//! and the shared `/dev/null`; these die as soon as the fork has succeeded
//! (or the spawn failed). *Close-on-termination* holds the parent-side pipe
//! ends; from a successful spawn onwards they belong to the streams and only
//! the termination protocol closes them. Because every set member is an
//! [`FdHandle`], the error path unwinds by simply dropping the locals.

use std::ffi::CString;
use std::io;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;

use nix::errno::Errno;
use tracing::{debug, info};

use crate::config::{self, OutputConfig, StdinConfig};
use crate::error::SpawnError;
use crate::fd::FdHandle;
use crate::fork_exec::{fork_exec, ChildStdio, ForkExecError};
use crate::pipe;
use crate::process::{Command, ProcessShared, Subprocess};
use crate::stream::{InputInner, InputStream, OutputInner, OutputStream};
use crate::watcher;

/// One provisioned standard stream: what the child gets, and the parent end
/// if the stream is a pipe.
struct StreamSetup {
    child_fd: RawFd,
    parent_end: Option<FdHandle>,
}

pub(super) fn spawn(cmd: &Command) -> Result<Subprocess, SpawnError> {
    // All marshalling happens before any descriptor work so a NUL-byte
    // mistake cannot leak pipes.
    let program = CString::new(cmd.program.as_os_str().as_bytes())
        .map_err(|_| SpawnError::InvalidArgument)?;
    let argv = config::build_argv(&cmd.program, cmd.arg0.as_deref(), &cmd.args)
        .map_err(|_| SpawnError::InvalidArgument)?;
    let envp = cmd
        .env
        .to_env_block()
        .map_err(|_| SpawnError::InvalidArgument)?;

    let mut close_after_spawn: Vec<FdHandle> = Vec::new();
    let mut dev_null: Option<FdHandle> = None;

    let stdin = provision_stdin(&cmd.stdin, &mut close_after_spawn, &mut dev_null)
        .map_err(SpawnError::Stdin)?;
    let stdout = provision_output(&cmd.stdout, &mut close_after_spawn, &mut dev_null)
        .map_err(SpawnError::Stdout)?;
    let stderr = provision_output(&cmd.stderr, &mut close_after_spawn, &mut dev_null)
        .map_err(SpawnError::Stderr)?;

    // The watcher parks before the fork so it can never race it, and never
    // observes a pid it was not handed.
    let watcher = watcher::spawn().map_err(|e| SpawnError::Fork {
        message: "failed to start watcher thread",
        errno: Errno::from_raw(e.raw_os_error().unwrap_or(0)),
    })?;

    let stdio = ChildStdio {
        stdin: stdin.child_fd,
        stdout: stdout.child_fd,
        stderr: stderr.child_fd,
    };

    let pid = match fork_exec(&program, &argv, &envp, stdio) {
        Ok(pid) => pid,
        Err(e) => {
            // Dropping the locals closes both descriptor sets.
            watcher.cancel();
            debug!(program = %cmd.program.display(), error = %e, "spawn failed");
            return Err(classify(e));
        }
    };

    // Child-side descriptors are the child's problem now; close errors on
    // the parent side are of no consequence.
    drop(close_after_spawn);
    drop(dev_null);

    let stdin_inner = stdin.parent_end.map(InputInner::new);
    let stdout_inner = stdout.parent_end.map(OutputInner::new);
    let stderr_inner = stderr.parent_end.map(OutputInner::new);

    let shared = Arc::new(ProcessShared::new(
        pid,
        stdin_inner.clone(),
        stdout_inner.clone(),
        stderr_inner.clone(),
    ));
    watcher.resume(Arc::clone(&shared));

    info!(pid = %pid, program = %cmd.program.display(), "spawned child process");

    Ok(Subprocess::new(
        shared,
        stdin_inner.map(InputStream::new),
        stdout_inner.map(OutputStream::new),
        stderr_inner.map(OutputStream::new),
    ))
}

fn provision_stdin(
    config: &StdinConfig,
    close_after_spawn: &mut Vec<FdHandle>,
    dev_null: &mut Option<FdHandle>,
) -> io::Result<StreamSetup> {
    match config {
        StdinConfig::Null => Ok(StreamSetup {
            child_fd: open_dev_null(dev_null)?,
            parent_end: None,
        }),
        StdinConfig::Pipe { buffer_size } => {
            let (read_end, write_end) = pipe::create().map_err(errno_io)?;
            let child_fd = read_end.get().expect("fresh pipe end is open");
            let parent_fd = write_end.get().expect("fresh pipe end is open");
            pipe::set_nonblocking(parent_fd).map_err(errno_io)?;
            if let Some(bytes) = buffer_size {
                pipe::set_buffer_size(parent_fd, *bytes).map_err(errno_io)?;
            }
            close_after_spawn.push(read_end);
            Ok(StreamSetup {
                child_fd,
                parent_end: Some(write_end),
            })
        }
        StdinConfig::File {
            fd,
            close_after_spawn: close,
        } => {
            if *close {
                close_after_spawn.push(FdHandle::from_raw(*fd));
            }
            Ok(StreamSetup {
                child_fd: *fd,
                parent_end: None,
            })
        }
    }
}

fn provision_output(
    config: &OutputConfig,
    close_after_spawn: &mut Vec<FdHandle>,
    dev_null: &mut Option<FdHandle>,
) -> io::Result<StreamSetup> {
    match config {
        OutputConfig::Discard => Ok(StreamSetup {
            child_fd: open_dev_null(dev_null)?,
            parent_end: None,
        }),
        OutputConfig::Pipe { buffer_size } => {
            let (read_end, write_end) = pipe::create().map_err(errno_io)?;
            let child_fd = write_end.get().expect("fresh pipe end is open");
            let parent_fd = read_end.get().expect("fresh pipe end is open");
            pipe::set_nonblocking(parent_fd).map_err(errno_io)?;
            if let Some(bytes) = buffer_size {
                // The size hint applies to the write end, as the kernel
                // accounts pipe capacity there.
                pipe::set_buffer_size(child_fd, *bytes).map_err(errno_io)?;
            }
            close_after_spawn.push(write_end);
            Ok(StreamSetup {
                child_fd,
                parent_end: Some(read_end),
            })
        }
        OutputConfig::File {
            fd,
            close_after_spawn: close,
        } => {
            if *close {
                close_after_spawn.push(FdHandle::from_raw(*fd));
            }
            Ok(StreamSetup {
                child_fd: *fd,
                parent_end: None,
            })
        }
    }
}

/// Open `/dev/null` read-write once per spawn and reuse it across streams.
///
/// `std` opens with `O_CLOEXEC`, which is what we want: `dup2` clears the
/// flag on the child's copies, and the sweep in the child closes this one.
fn open_dev_null(dev_null: &mut Option<FdHandle>) -> io::Result<RawFd> {
    if dev_null.is_none() {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/null")?;
        *dev_null = Some(FdHandle::from_owned(file.into()));
    }
    Ok(dev_null
        .as_ref()
        .and_then(|h| h.get().ok())
        .expect("dev/null handle was just opened"))
}

fn errno_io(errno: Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

fn classify(error: ForkExecError) -> SpawnError {
    match error {
        ForkExecError::ChildExec(errno) => SpawnError::Exec(errno),
        ForkExecError::PipeOpen(errno) => SpawnError::Fork {
            message: "failed to open the sync pipe",
            errno,
        },
        ForkExecError::Fork(errno) => SpawnError::Fork {
            message: "fork failed",
            errno,
        },
        ForkExecError::PipeRead(errno) => SpawnError::Fork {
            message: "failed to read the sync pipe",
            errno,
        },
        ForkExecError::ChildDup2(errno) => SpawnError::Fork {
            message: "child failed to redirect a standard stream",
            errno,
        },
        ForkExecError::ChildCloexec(errno) => SpawnError::Fork {
            message: "child failed to mark the sync pipe close-on-exec",
            errno,
        },
    }
}
