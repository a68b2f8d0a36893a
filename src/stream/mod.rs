//! Non-blocking standard-stream I/O
//!
//! An [`InputStream`] wraps the non-blocking write end of the child's stdin
//! pipe; an [`OutputStream`] wraps the non-blocking read end of a stdout or
//! stderr pipe. Each stream serialises its caller-facing operations behind
//! its own lock: callers are expected to funnel all I/O on one stream
//! through one logical task, and the streams are deliberately not
//! multi-producer.

mod input;
mod output;

pub use input::InputStream;
pub use output::OutputStream;

pub(crate) use input::InputInner;
pub(crate) use output::OutputInner;
