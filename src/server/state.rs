//! Handshake state machine.
//!
//! ```text
//! Uninitialized --initialize--> Initializing --ok--> Operational
//!                                      \--error--> (previous phase)
//! Operational --initialize--> Initializing --ok--> Operational
//! ```
//!
//! Only `initialize` and `ping` are served before the handshake completes.

use serde_json::Value;
use tracing::{info, warn};

/// Protocol revisions the server understands, preferred first.
pub const SUPPORTED_PROTOCOL_VERSIONS: [&str; 3] = ["2025-06-18", "2025-03-26", "2024-11-05"];

/// The version answered to clients asking for one the server does not know.
#[must_use]
pub fn preferred_version() -> &'static str {
    SUPPORTED_PROTOCOL_VERSIONS[0]
}

/// Methods allowed before the handshake completes.
const PRE_HANDSHAKE_METHODS: [&str; 2] = ["initialize", "ping"];

/// Handshake phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No successful `initialize` yet.
    Uninitialized,
    /// An `initialize` request is being processed.
    Initializing,
    /// Handshake complete; every method is served.
    Operational,
}

/// Per-process protocol state.
#[derive(Debug, Clone)]
pub struct HandshakeState {
    phase: Phase,
    protocol_version: Option<String>,
    client_capabilities: Value,
    client_info: Option<Value>,
    client_initialized: bool,
}

impl Default for HandshakeState {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeState {
    /// Fresh, uninitialized state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: Phase::Uninitialized,
            protocol_version: None,
            client_capabilities: Value::Null,
            client_info: None,
            client_initialized: false,
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether the handshake has completed.
    #[must_use]
    pub fn is_operational(&self) -> bool {
        self.phase == Phase::Operational
    }

    /// Whether `method` may be served in the current phase.
    #[must_use]
    pub fn allows(&self, method: &str) -> bool {
        self.is_operational() || PRE_HANDSHAKE_METHODS.contains(&method)
    }

    /// Negotiated protocol version, once operational.
    #[must_use]
    pub fn protocol_version(&self) -> Option<&str> {
        self.protocol_version.as_deref()
    }

    /// Capabilities the client announced in `initialize`.
    #[must_use]
    pub fn client_capabilities(&self) -> &Value {
        &self.client_capabilities
    }

    /// `clientInfo` from `initialize`, if sent.
    #[must_use]
    pub fn client_info(&self) -> Option<&Value> {
        self.client_info.as_ref()
    }

    /// Whether `notifications/initialized` has been received.
    #[must_use]
    pub fn client_initialized(&self) -> bool {
        self.client_initialized
    }

    /// Enter `Initializing`; returns the phase to restore if the handshake fails.
    pub fn begin(&mut self) -> Phase {
        let previous = self.phase;
        if previous == Phase::Operational {
            warn!("initialize received while already operational, renegotiating");
        }
        self.phase = Phase::Initializing;
        previous
    }

    /// Abort a handshake started with [`begin`](Self::begin).
    pub fn abort(&mut self, previous: Phase) {
        self.phase = previous;
    }

    /// Finish the handshake and return the negotiated version.
    pub fn complete(
        &mut self,
        requested: &str,
        capabilities: Value,
        client_info: Option<Value>,
    ) -> String {
        let version = negotiate(requested);
        if version != requested {
            info!(
                requested,
                negotiated = version,
                "unsupported protocol version requested, answering with preferred"
            );
        }

        self.protocol_version = Some(version.to_owned());
        self.client_capabilities = capabilities;
        self.client_info = client_info;
        self.phase = Phase::Operational;
        version.to_owned()
    }

    /// Record `notifications/initialized`.
    pub fn mark_client_initialized(&mut self) {
        self.client_initialized = true;
    }
}

/// Echo a supported version; answer anything else with the preferred one.
#[must_use]
pub fn negotiate(requested: &str) -> &'static str {
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .copied()
        .find(|v| *v == requested)
        .unwrap_or_else(preferred_version)
}
