//! Protocol server: method dispatch, pagination and result normalization.
//!
//! [`ProtocolServer::handle`] classifies one inbound envelope and returns a
//! [`Dispatch`] telling the transport what to do with it. Handshake, listing
//! and notification handling complete synchronously, in arrival order. Tool
//! calls and resource reads are returned as deferred futures that the
//! transport runs on their own tasks, so a long command never blocks the
//! framing of later messages.
//!
//! Every request with an id produces exactly one response, including when a
//! tool handler panics.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::resources::ResourceRegistry;
use super::state::{HandshakeState, Phase, SUPPORTED_PROTOCOL_VERSIONS};
use crate::config::ServerConfig;
use crate::rpc::message::{codes, Message, MessageKind, RequestId, RpcError, JSONRPC_VERSION};
use crate::tools::{ToolCall, ToolOutput, ToolRegistry};

/// Boxed response future run outside the read loop.
pub type DeferredResponse = Pin<Box<dyn Future<Output = Message> + Send + 'static>>;

/// How the transport should act on one inbound message.
pub enum Dispatch {
    /// Write this response now.
    Reply(Message),
    /// Run this future on its own task and write its output.
    Deferred(DeferredResponse),
    /// Nothing to send.
    Silent,
    /// The client asked the server to exit.
    Disconnect,
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reply(msg) => f.debug_tuple("Reply").field(msg).finish(),
            Self::Deferred(_) => f.write_str("Deferred"),
            Self::Silent => f.write_str("Silent"),
            Self::Disconnect => f.write_str("Disconnect"),
        }
    }
}

/// `tools/call` result envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    /// Content blocks.
    pub content: Vec<Content>,
    /// Whether the tool reported a failure.
    pub is_error: bool,
}

/// One content block of a tool result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Content {
    /// Plain text.
    Text {
        /// Body.
        text: String,
    },
    /// Base64 image.
    Image {
        /// Base64 payload.
        data: String,
        /// MIME type.
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

impl From<ToolOutput> for CallToolResult {
    fn from(output: ToolOutput) -> Self {
        match output {
            ToolOutput::Error {
                error,
                result_for_assistant,
            } => Self {
                content: vec![Content::Text {
                    text: result_for_assistant
                        .filter(|text| !text.is_empty())
                        .unwrap_or(error),
                }],
                is_error: true,
            },
            ToolOutput::Image { base64, media_type } => Self {
                content: vec![Content::Image {
                    data: base64,
                    mime_type: media_type,
                }],
                is_error: false,
            },
            ToolOutput::Result {
                data,
                result_for_assistant,
            } => {
                let text = match result_for_assistant {
                    Some(text) => text,
                    None => {
                        serde_json::to_string_pretty(&data).unwrap_or_else(|_| data.to_string())
                    }
                };
                Self {
                    content: vec![Content::Text { text }],
                    is_error: false,
                }
            }
        }
    }
}

/// Server identity reported in `initialize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    /// Server name.
    pub name: String,
    /// Server version.
    pub version: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeParams {
    #[serde(default)]
    protocol_version: Option<Value>,
    #[serde(default)]
    capabilities: Value,
    #[serde(default)]
    client_info: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct PageParams {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CallToolParams {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Default, Deserialize)]
struct ReadResourceParams {
    #[serde(default)]
    uri: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelledParams {
    request_id: RequestId,
    #[serde(default)]
    reason: Option<String>,
}

/// A `tools/call` that has been dispatched and not yet answered.
#[derive(Debug)]
struct RunningCall {
    call_id: String,
    cancel: CancellationToken,
}

/// In-flight `tools/call` requests by id.
type InFlight = Arc<Mutex<HashMap<RequestId, RunningCall>>>;

/// Protocol server: handshake state, tool and resource registries.
#[derive(Debug)]
pub struct ProtocolServer {
    info: ServerInfo,
    page_size: usize,
    max_line_bytes: usize,
    tools: ToolRegistry,
    resources: ResourceRegistry,
    state: Mutex<HandshakeState>,
    in_flight: InFlight,
}

impl ProtocolServer {
    /// Build a server around fixed registries.
    #[must_use]
    pub fn new(config: &ServerConfig, tools: ToolRegistry, resources: ResourceRegistry) -> Self {
        Self {
            info: ServerInfo {
                name: config.name.clone(),
                version: config.version.clone(),
            },
            page_size: config.page_size.max(1),
            max_line_bytes: config.max_line_bytes.max(1),
            tools,
            resources,
            state: Mutex::new(HandshakeState::new()),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Snapshot of the handshake state.
    #[must_use]
    pub fn handshake(&self) -> HandshakeState {
        self.lock_state().clone()
    }

    /// Longest inbound line the transport should frame.
    #[must_use]
    pub fn max_line_bytes(&self) -> usize {
        self.max_line_bytes
    }

    /// Number of `tools/call` requests still running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.lock_in_flight().len()
    }

    /// Fire the cancellation handle of every running tool call.
    pub fn cancel_all(&self) {
        for running in self.lock_in_flight().values() {
            running.cancel.cancel();
        }
    }

    /// Classify and handle one inbound envelope.
    pub fn handle(self: &Arc<Self>, message: Message) -> Dispatch {
        if message.jsonrpc != JSONRPC_VERSION {
            warn!(jsonrpc = message.jsonrpc, "unsupported jsonrpc version");
            return match message.id {
                Some(id) => Dispatch::Reply(Message::error_response(
                    Some(id),
                    RpcError::invalid_request("jsonrpc must be \"2.0\""),
                )),
                None => Dispatch::Silent,
            };
        }

        match message.kind() {
            MessageKind::Request => self.handle_request(message),
            MessageKind::Notification => self.handle_notification(&message),
            MessageKind::Response => {
                debug!(id = ?message.id, "dropping response sent by client");
                Dispatch::Silent
            }
            MessageKind::Invalid => {
                warn!(id = ?message.id, "envelope has no method");
                match message.id {
                    Some(id) => Dispatch::Reply(Message::error_response(
                        Some(id),
                        RpcError::invalid_request("missing method"),
                    )),
                    None => Dispatch::Silent,
                }
            }
        }
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    fn handle_request(self: &Arc<Self>, message: Message) -> Dispatch {
        let Message {
            id, method, params, ..
        } = message;
        let (Some(id), Some(method)) = (id, method) else {
            return Dispatch::Silent;
        };
        let params = params.unwrap_or(Value::Null);

        if !self.lock_state().allows(&method) {
            debug!(method, "rejecting request before handshake");
            return Dispatch::Reply(Message::error_response(
                Some(id),
                RpcError::not_initialized(),
            ));
        }

        let outcome = match method.as_str() {
            "initialize" => self.initialize(params),
            "ping" => Ok(json!({ "timestamp": chrono::Utc::now().to_rfc3339() })),
            "tools/list" => self.list_tools(params),
            "tools/call" => return self.call_tool(id, params),
            "resources/list" => Ok(json!({
                "resources": self.resources.descriptors(),
                "nextCursor": "",
            })),
            "resources/read" => return self.read_resource(id, params),
            "resources/subscribe" => Err(RpcError::new(
                codes::METHOD_NOT_FOUND,
                "resource subscriptions are not supported",
            )),
            "resources/templates/list" => Ok(json!({
                "resourceTemplates": [],
                "nextCursor": "",
            })),
            other => Err(RpcError::method_not_found(other)),
        };

        Dispatch::Reply(match outcome {
            Ok(result) => Message::response(id, result),
            Err(error) => Message::error_response(Some(id), error),
        })
    }

    fn initialize(&self, params: Value) -> Result<Value, RpcError> {
        let mut state = self.lock_state();
        let previous = state.begin();

        let params: InitializeParams = match parse_params(params) {
            Ok(params) => params,
            Err(err) => {
                state.abort(previous);
                return Err(err);
            }
        };

        let Some(Value::String(requested)) = params.protocol_version else {
            state.abort(previous);
            return Err(RpcError::new(codes::INVALID_VERSION, "missing protocol version")
                .with_data(json!({ "supportedVersions": SUPPORTED_PROTOCOL_VERSIONS })));
        };

        let version = state.complete(&requested, params.capabilities, params.client_info);
        if previous == Phase::Operational {
            info!(version, "session re-initialized");
        } else {
            info!(version, "handshake complete");
        }

        Ok(json!({
            "protocolVersion": version,
            "serverInfo": self.info,
            "capabilities": {
                "tools": { "listChanged": false },
                "resources": { "subscribe": false, "listChanged": false },
                "logging": {},
            },
        }))
    }

    fn list_tools(&self, params: Value) -> Result<Value, RpcError> {
        let params: PageParams = parse_params(params)?;
        let (tools, next_cursor) = paginate(
            &self.tools.descriptors(),
            params.cursor.as_deref(),
            params.limit,
            self.page_size,
        )?;
        Ok(json!({ "tools": tools, "nextCursor": next_cursor }))
    }

    fn call_tool(self: &Arc<Self>, id: RequestId, params: Value) -> Dispatch {
        let params: CallToolParams = match parse_params(params) {
            Ok(params) => params,
            Err(err) => return Dispatch::Reply(Message::error_response(Some(id), err)),
        };

        let Some(name) = params.name else {
            return Dispatch::Reply(Message::error_response(
                Some(id),
                RpcError::invalid_params("missing tool name"),
            ));
        };

        let Some(tool) = self.tools.get(&name) else {
            warn!(tool = name, "unknown tool requested");
            return Dispatch::Reply(Message::error_response(
                Some(id),
                RpcError::invalid_params(format!("unknown tool: {name}")),
            ));
        };

        let cancel = CancellationToken::new();
        let call_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_owned();
        let running = RunningCall {
            call_id: call_id.clone(),
            cancel: cancel.clone(),
        };
        if let Some(stale) = self.lock_in_flight().insert(id.clone(), running) {
            warn!(request_id = %id, "duplicate request id, cancelling earlier call");
            stale.cancel.cancel();
        }

        let handler = Arc::clone(&tool.handler);
        let in_flight = Arc::clone(&self.in_flight);
        let span = info_span!("call_tool", tool = %name, call_id = %call_id, request_id = %id);

        let call = ToolCall {
            call_id: call_id.clone(),
            input: params.arguments,
            cancel,
        };

        Dispatch::Deferred(Box::pin(
            async move {
                let outcome = AssertUnwindSafe(handler.call(call)).catch_unwind().await;
                release(&in_flight, &id, &call_id);

                match outcome {
                    Ok(Ok(output)) => {
                        let result = CallToolResult::from(output);
                        debug!(is_error = result.is_error, "tool call finished");
                        match serde_json::to_value(result) {
                            Ok(value) => Message::response(id, value),
                            Err(err) => Message::error_response(
                                Some(id),
                                RpcError::internal(format!("cannot encode tool result: {err}")),
                            ),
                        }
                    }
                    Ok(Err(err)) => {
                        warn!(%err, "tool execution failed");
                        Message::error_response(
                            Some(id),
                            RpcError::internal(format!("tool execution failed: {err}"))
                                .with_data(json!({ "message": err.to_string() })),
                        )
                    }
                    Err(_) => {
                        warn!("tool handler panicked");
                        Message::error_response(
                            Some(id),
                            RpcError::internal("tool execution failed: handler panicked"),
                        )
                    }
                }
            }
            .instrument(span),
        ))
    }

    fn read_resource(&self, id: RequestId, params: Value) -> Dispatch {
        let params: ReadResourceParams = match parse_params(params) {
            Ok(params) => params,
            Err(err) => return Dispatch::Reply(Message::error_response(Some(id), err)),
        };

        let Some(uri) = params.uri else {
            return Dispatch::Reply(Message::error_response(
                Some(id),
                RpcError::invalid_params("missing resource uri"),
            ));
        };

        let Some(resource) = self.resources.get(&uri).cloned() else {
            return Dispatch::Reply(Message::error_response(
                Some(id),
                RpcError::invalid_params(format!("unknown resource: {uri}")),
            ));
        };

        Dispatch::Deferred(Box::pin(async move {
            match resource.contents().await {
                Ok(contents) => Message::response(id, json!({ "contents": [contents] })),
                Err(err) => Message::error_response(
                    Some(id),
                    RpcError::internal(format!("resource read failed: {err}")),
                ),
            }
        }))
    }

    // ── Notifications ─────────────────────────────────────────────────────────

    fn handle_notification(&self, message: &Message) -> Dispatch {
        let method = message.method.as_deref().unwrap_or_default();

        match method {
            "notifications/initialized" => {
                self.lock_state().mark_client_initialized();
                debug!("client reported initialized");
            }
            "notifications/disconnect" => {
                info!("client requested disconnect");
                return Dispatch::Disconnect;
            }
            "notifications/cancelled" => self.cancel_request(message.params_or_null()),
            other => debug!(method = other, "ignoring notification"),
        }

        Dispatch::Silent
    }

    fn cancel_request(&self, params: &Value) {
        let params: CancelledParams = match serde_json::from_value(params.clone()) {
            Ok(params) => params,
            Err(err) => {
                debug!(%err, "malformed cancellation notification");
                return;
            }
        };

        match self.lock_in_flight().get(&params.request_id) {
            Some(running) => {
                info!(
                    request_id = %params.request_id,
                    reason = params.reason.as_deref().unwrap_or(""),
                    "cancelling tool call"
                );
                running.cancel.cancel();
            }
            None => debug!(request_id = %params.request_id, "no running call to cancel"),
        }
    }

    // ── Private helpers ───────────────────────────────────────────────────────

    fn lock_state(&self) -> std::sync::MutexGuard<'_, HandshakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, RunningCall>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Remove `id` from the in-flight map unless a newer call reused the id.
fn release(in_flight: &InFlight, id: &RequestId, call_id: &str) {
    let mut map = in_flight.lock().unwrap_or_else(PoisonError::into_inner);
    if map.get(id).is_some_and(|running| running.call_id == call_id) {
        map.remove(id);
    }
}

/// Deserialize request params; absent params become `T::default()`.
fn parse_params<T: serde::de::DeserializeOwned + Default>(params: Value) -> Result<T, RpcError> {
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params)
        .map_err(|err| RpcError::invalid_params(format!("invalid params: {err}")))
}

/// Slice one page out of `items`.
///
/// The cursor is the decimal offset of the first item; empty or absent
/// means the start. `limit` of `None` or `0` uses `default_limit`. Returns
/// the page and the next cursor, which is `""` once the list is exhausted.
///
/// # Errors
///
/// Returns an invalid-params error when the cursor is not a number.
pub fn paginate<T: Clone>(
    items: &[T],
    cursor: Option<&str>,
    limit: Option<usize>,
    default_limit: usize,
) -> Result<(Vec<T>, String), RpcError> {
    let start = match cursor.map(str::trim) {
        None | Some("") => 0,
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| RpcError::invalid_params(format!("invalid cursor: {raw}")))?,
    };
    let limit = match limit {
        None | Some(0) => default_limit.max(1),
        Some(n) => n,
    };

    let start = start.min(items.len());
    let end = start.saturating_add(limit).min(items.len());
    let next = if end < items.len() {
        end.to_string()
    } else {
        String::new()
    };

    Ok((items[start..end].to_vec(), next))
}
