//! Persistent shell execution engine.
//!
//! - `channels`: side-channel files and the composite command line.
//! - `probe`: pluggable completion detection.
//! - `process`: descendant enumeration and signalling.
//! - `queue`: FIFO serialization of commands onto one shell.
//! - `session`: the shell process, `exec`, `pwd`, `set_cwd`, teardown.
//! - `manager`: lazy creation and replacement of the session.

pub mod channels;
pub mod manager;
pub mod probe;
pub mod process;
pub mod queue;
pub mod session;

pub use manager::ShellManager;
pub use session::{ExecOutput, ShellSession};
