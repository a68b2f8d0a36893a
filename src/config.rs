//! Stdio, argument, and environment configuration for spawned children
//!
//! These descriptors say how each of the child's standard streams is
//! provisioned and how its argument vector and environment block are built.
//! Marshalling into NUL-terminated byte vectors happens here, before any
//! `fork`, so the signal-safe child arm never allocates.

use std::ffi::{CString, NulError, OsStr, OsString};
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// How the child's stdin is provisioned.
#[derive(Debug, Clone)]
pub enum StdinConfig {
    /// Redirect from `/dev/null`.
    Null,
    /// A pipe whose non-blocking write end is exposed to the parent as an
    /// [`InputStream`](crate::InputStream).
    Pipe {
        /// Optional pipe buffer size hint (Linux only, best-effort).
        buffer_size: Option<usize>,
    },
    /// A caller-owned descriptor becomes the child's stdin.
    File {
        fd: RawFd,
        /// Close the descriptor on the parent side once the child is spawned.
        close_after_spawn: bool,
    },
}

impl StdinConfig {
    /// A pipe with the default buffer size.
    pub fn pipe() -> Self {
        StdinConfig::Pipe { buffer_size: None }
    }
}

impl Default for StdinConfig {
    fn default() -> Self {
        StdinConfig::Null
    }
}

/// How the child's stdout or stderr is provisioned.
#[derive(Debug, Clone)]
pub enum OutputConfig {
    /// Redirect to `/dev/null`.
    Discard,
    /// A pipe whose non-blocking read end is exposed to the parent as an
    /// [`OutputStream`](crate::OutputStream).
    Pipe {
        /// Optional pipe buffer size hint (Linux only, best-effort).
        buffer_size: Option<usize>,
    },
    /// A caller-owned descriptor becomes the child's stdout/stderr.
    File {
        fd: RawFd,
        /// Close the descriptor on the parent side once the child is spawned.
        close_after_spawn: bool,
    },
}

impl OutputConfig {
    /// A pipe with the default buffer size.
    pub fn pipe() -> Self {
        OutputConfig::Pipe { buffer_size: None }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig::Discard
    }
}

/// The child's environment block.
#[derive(Debug, Clone)]
pub enum Env {
    /// Inherit the parent's environment, with the given entries replacing
    /// any parent entry of the same key.
    Inherit { overrides: Vec<(OsString, OsString)> },
    /// Use exactly the given entries.
    Custom(Vec<(OsString, OsString)>),
}

impl Default for Env {
    fn default() -> Self {
        Env::Inherit { overrides: Vec::new() }
    }
}

impl Env {
    pub(crate) fn push(&mut self, key: OsString, value: OsString) {
        match self {
            Env::Inherit { overrides } => overrides.push((key, value)),
            Env::Custom(entries) => entries.push((key, value)),
        }
    }

    /// Marshal the environment into `KEY=VALUE` C strings.
    ///
    /// For `Inherit`, the snapshot of the parent environment is taken here,
    /// once, and never consulted again. Override entries come first, followed
    /// by the surviving parent entries. A parent entry survives unless its
    /// key equals an override key that has a valid UTF-8 form: override keys
    /// that are not valid UTF-8 are appended but displace nothing.
    pub(crate) fn to_env_block(&self) -> Result<Vec<CString>, NulError> {
        match self {
            Env::Custom(entries) => entries.iter().map(entry_to_cstring).collect(),
            Env::Inherit { overrides } => {
                let removable: Vec<&OsStr> = overrides
                    .iter()
                    .filter(|(key, _)| key.to_str().is_some())
                    .map(|(key, _)| key.as_os_str())
                    .collect();

                let mut block = Vec::with_capacity(overrides.len());
                for entry in overrides {
                    block.push(entry_to_cstring(entry)?);
                }
                for (key, value) in std::env::vars_os() {
                    if removable.iter().any(|k| *k == key.as_os_str()) {
                        continue;
                    }
                    block.push(entry_to_cstring(&(key, value))?);
                }
                Ok(block)
            }
        }
    }
}

fn entry_to_cstring((key, value): &(OsString, OsString)) -> Result<CString, NulError> {
    let mut bytes = Vec::with_capacity(key.len() + value.len() + 1);
    bytes.extend_from_slice(key.as_bytes());
    bytes.push(b'=');
    bytes.extend_from_slice(value.as_bytes());
    CString::new(bytes)
}

/// Build the child's NUL-terminated argument vector.
///
/// `arg0`, when present, becomes `argv[0]`; otherwise the executable path is
/// duplicated into that slot.
pub(crate) fn build_argv(
    program: &Path,
    arg0: Option<&OsStr>,
    args: &[OsString],
) -> Result<Vec<CString>, NulError> {
    let mut argv = Vec::with_capacity(args.len() + 1);
    match arg0 {
        Some(name) => argv.push(CString::new(name.as_bytes())?),
        None => argv.push(CString::new(program.as_os_str().as_bytes())?),
    }
    for arg in args {
        argv.push(CString::new(arg.as_bytes())?);
    }
    Ok(argv)
}
