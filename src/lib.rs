//! Async POSIX subprocess management
//!
//! This crate spawns and controls external executables on top of tokio:
//! hand-rolled `fork`/`execve` with a signal-safe child bootstrap, standard
//! streams carried over non-blocking pipes, and termination observed by a
//! dedicated `waitpid` thread per child that wakes every waiting task.
//!
//! ## Components
//!
//! - [`Command`]: builder for the executable path, arguments, environment,
//!   and the three stdio configurations
//! - [`Subprocess`]: handle to a running child — signals, termination
//!   waiting, and combined output collection
//! - [`InputStream`] / [`OutputStream`]: the parent ends of stdio pipes
//! - [`SpawnError`] / [`ProcessError`]: classified initialization and
//!   runtime errors
//!
//! ## Blocking is not hidden
//!
//! A child that fills a pipe nobody drains will block, and a parent that
//! waits for termination without draining will deadlock with it. Use
//! [`Subprocess::wait_with_output`] when in doubt: it drains both output
//! streams concurrently with the wait.

pub mod config;
pub mod error;
pub mod fd;
mod fork_exec;
mod pipe;
pub mod process;
pub mod stream;
mod watcher;

pub use config::{Env, OutputConfig, StdinConfig};
pub use error::{ProcessError, Result, SpawnError};
pub use process::{Command, ExitStatus, Output, Subprocess};
pub use stream::{InputStream, OutputStream};

// The signal set delivered to children. All of SIGINT, SIGTERM, SIGSTOP,
// SIGCONT, SIGKILL, SIGHUP, SIGQUIT, SIGUSR1, SIGUSR2, SIGALRM and SIGWINCH
// are available as variants.
pub use nix::sys::signal::Signal;

/// Core utilities and helper functions
pub mod utils {
    use tracing::info;

    /// Initialize tracing for the application
    pub fn init_tracing(level: &str) -> crate::Result<()> {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

        fmt()
            .with_env_filter(filter)
            .try_init()
            .map_err(|e| crate::ProcessError::TracingInit(e.to_string()))?;

        info!("Tracing initialized with level: {}", level);
        Ok(())
    }
}
