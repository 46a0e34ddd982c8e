#![forbid(unsafe_code)]

//! Persistent shell execution engine exposed over stdio JSON-RPC.
//!
//! - [`shell`]: one long-lived shell process, FIFO command queue, timeouts,
//!   cancellation and descendant kill.
//! - [`rpc`]: envelope types, NDJSON framing, the stdio transport loop.
//! - [`server`]: handshake state machine and method dispatch.
//! - [`tools`]: tool registry, handler contract and the built-in tools.

pub mod config;
pub mod errors;
pub mod rpc;
pub mod server;
pub mod shell;
pub mod tools;

pub use config::Config;
pub use errors::{AppError, Result};
