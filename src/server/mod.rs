//! Protocol server: handshake, dispatch and static resources.

pub mod dispatch;
pub mod resources;
pub mod state;

pub use dispatch::{paginate, CallToolResult, Content, Dispatch, ProtocolServer};
pub use resources::ResourceRegistry;
pub use state::{HandshakeState, Phase, SUPPORTED_PROTOCOL_VERSIONS};
