//! Error types for spawning and controlling child processes

use nix::errno::Errno;
use nix::sys::signal::Signal;
use thiserror::Error;

/// Classified initialization errors surfaced by [`Command::spawn`](crate::Command::spawn)
///
/// Each variant identifies the stage of initialization that failed, so a
/// caller can distinguish "your stdout configuration is broken" from "the
/// executable does not exist". All resources acquired before the failure are
/// released before the error is returned.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Failed to set up stdin: {0}")]
    Stdin(#[source] std::io::Error),

    #[error("Failed to set up stdout: {0}")]
    Stdout(#[source] std::io::Error),

    #[error("Failed to set up stderr: {0}")]
    Stderr(#[source] std::io::Error),

    #[error("Failed to fork child ({message}): {errno}")]
    Fork {
        message: &'static str,
        #[source]
        errno: Errno,
    },

    #[error("Failed to exec child: {0}")]
    Exec(#[source] Errno),

    #[error("Argument or environment entry contains an interior NUL byte")]
    InvalidArgument,
}

impl SpawnError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            SpawnError::Stdin(_) => "SPAWN001",
            SpawnError::Stdout(_) => "SPAWN002",
            SpawnError::Stderr(_) => "SPAWN003",
            SpawnError::Fork { .. } => "SPAWN004",
            SpawnError::Exec(_) => "SPAWN005",
            SpawnError::InvalidArgument => "SPAWN006",
        }
    }
}

/// Runtime errors from signal delivery and stream I/O
///
/// `WouldBlock` conditions are never reported through this type: the stream
/// operations map `EAGAIN`/`EWOULDBLOCK` to `None` instead.
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The stream (or descriptor) was closed before or during the operation.
    /// Bulk readers treat this as end-of-file rather than a failure.
    #[error("Stream is closed")]
    Closed,

    #[error("Failed to send signal {signal} to pid {pid}: {errno}")]
    Signal {
        signal: Signal,
        pid: i32,
        #[source]
        errno: Errno,
    },

    #[error("Read failed: {0}")]
    Read(#[source] Errno),

    #[error("Write failed: {0}")]
    Write(#[source] Errno),

    #[error("Failed to close descriptor: {0}")]
    Close(#[source] Errno),

    #[error("Failed to buffer input source: {0}")]
    Buffer(#[from] std::io::Error),

    #[error("Output is not valid UTF-8: {0}")]
    Decode(#[source] std::string::FromUtf8Error),

    #[error("Failed to initialize tracing: {0}")]
    TracingInit(String),
}

impl ProcessError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            ProcessError::Closed => "PROC001",
            ProcessError::Signal { .. } => "PROC002",
            ProcessError::Read(_) => "PROC003",
            ProcessError::Write(_) => "PROC004",
            ProcessError::Close(_) => "PROC005",
            ProcessError::Buffer(_) => "PROC006",
            ProcessError::Decode(_) => "PROC007",
            ProcessError::TracingInit(_) => "PROC008",
        }
    }
}

/// Crate result type for runtime operations
pub type Result<T> = std::result::Result<T, ProcessError>;
