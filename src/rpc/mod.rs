//! JSON-RPC over newline-delimited stdio.

pub mod codec;
pub mod message;
pub mod transport;

pub use message::{Message, RequestId, RpcError};
pub use transport::{serve, ExitReason};
