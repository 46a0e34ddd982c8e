//! JSON-RPC 2.0 envelope and error types.
//!
//! A single [`Message`] struct models every envelope on the wire. Whether it
//! is a request, notification or response follows from which fields are
//! present; see [`Message::kind`].

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The only protocol revision accepted in the `jsonrpc` field.
pub const JSONRPC_VERSION: &str = "2.0";

/// Fixed error codes used in [`RpcError::code`].
pub mod codes {
    /// Content was not valid JSON.
    pub const PARSE_ERROR: i64 = -32_700;
    /// Envelope is not a valid request.
    pub const INVALID_REQUEST: i64 = -32_600;
    /// Method is not served.
    pub const METHOD_NOT_FOUND: i64 = -32_601;
    /// Parameters are missing or malformed.
    pub const INVALID_PARAMS: i64 = -32_602;
    /// Handler failed.
    pub const INTERNAL_ERROR: i64 = -32_603;
    /// `initialize` without a usable protocol version.
    pub const INVALID_VERSION: i64 = -32_001;
    /// Request arrived before the handshake completed.
    pub const NOT_INITIALIZED: i64 = -32_002;
}

/// Request correlation id: a JSON number or string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer id.
    Number(i64),
    /// String id.
    String(String),
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// One of the [`codes`].
    pub code: i64,
    /// Human-readable description.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Build an error with no `data`.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured detail.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// `-32600`.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_REQUEST, message)
    }

    /// `-32601` for `method`.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    /// `-32602`.
    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    /// `-32603`.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }

    /// `-32002`.
    #[must_use]
    pub fn not_initialized() -> Self {
        Self::new(codes::NOT_INITIALIZED, "server not initialized")
    }
}

impl Display for RpcError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// What an envelope represents, derived from its fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `method` and `id`.
    Request,
    /// `method` without `id`.
    Notification,
    /// `id` with `result` or `error`, no `method`.
    Response,
    /// Anything else.
    Invalid,
}

/// A single JSON-RPC envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Protocol revision; must be `"2.0"`.
    #[serde(default)]
    pub jsonrpc: String,
    /// Correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    /// Method name for requests and notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Successful response payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error response payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Message {
    fn empty() -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        }
    }

    /// Successful response to `id`.
    #[must_use]
    pub fn response(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            ..Self::empty()
        }
    }

    /// Error response. `id` is `None` only when the request's id is unknown.
    #[must_use]
    pub fn error_response(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            id,
            error: Some(error),
            ..Self::empty()
        }
    }

    /// Request envelope.
    #[must_use]
    pub fn request(id: impl Into<RequestId>, method: &str, params: Option<Value>) -> Self {
        Self {
            id: Some(id.into()),
            method: Some(method.to_owned()),
            params,
            ..Self::empty()
        }
    }

    /// Notification envelope.
    #[must_use]
    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            method: Some(method.to_owned()),
            params,
            ..Self::empty()
        }
    }

    /// Classify this envelope by the fields it carries.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match (&self.method, &self.id) {
            (Some(_), Some(_)) => MessageKind::Request,
            (Some(_), None) => MessageKind::Notification,
            (None, Some(_)) if self.result.is_some() || self.error.is_some() => {
                MessageKind::Response
            }
            (None, _) => MessageKind::Invalid,
        }
    }

    /// Parameter object, or `Null` when absent.
    #[must_use]
    pub fn params_or_null(&self) -> &Value {
        self.params.as_ref().unwrap_or(&Value::Null)
    }
}
