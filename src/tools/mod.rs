//! Tool registry and the uniform handler contract.
//!
//! Every tool is a [`ToolDefinition`]: a name, a description, a JSON input
//! schema and a [`ToolHandler`]. The registry is built once at startup and
//! never mutated afterwards.

use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::shell::ShellManager;
use crate::Result;

pub mod bash;
pub mod cd;

/// Context handed to a handler for one invocation.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Short id used to correlate log lines for this call.
    pub call_id: String,
    /// The `arguments` object from `tools/call`.
    pub input: Value,
    /// Fires when the client cancels the request.
    pub cancel: CancellationToken,
}

/// What a handler produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    /// Structured data plus an optional rendering for the model.
    Result {
        /// Machine-readable payload.
        data: Value,
        /// Human-readable rendering; `data` is dumped as JSON when absent.
        result_for_assistant: Option<String>,
    },
    /// A tool-level failure reported to the model, not a protocol error.
    Error {
        /// Failure description.
        error: String,
        /// Preferred text for the model, if different from `error`.
        result_for_assistant: Option<String>,
    },
    /// Base64-encoded image.
    Image {
        /// Base64 payload.
        base64: String,
        /// MIME type, e.g. `image/png`.
        media_type: String,
    },
}

impl ToolOutput {
    /// Successful output with a text rendering.
    #[must_use]
    pub fn text(data: Value, rendered: impl Into<String>) -> Self {
        Self::Result {
            data,
            result_for_assistant: Some(rendered.into()),
        }
    }

    /// Tool-level failure.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
            result_for_assistant: None,
        }
    }
}

/// Boxed future returned by [`ToolHandler::call`].
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<ToolOutput>> + Send + 'a>>;

/// Implemented by every tool.
///
/// Returning `Err` means the handler itself failed; the server reports that
/// as a protocol-level internal error. Failures the model should see and
/// react to belong in [`ToolOutput::Error`].
pub trait ToolHandler: Send + Sync + Debug {
    /// Run one invocation.
    fn call(&self, call: ToolCall) -> ToolFuture<'_>;
}

/// A registered tool.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,
    /// One-paragraph description shown to the model.
    pub description: String,
    /// JSON schema for `arguments`.
    pub input_schema: Value,
    /// Implementation.
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolDefinition {
    /// Bundle a handler with its metadata.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            handler,
        }
    }

    /// Wire form used in `tools/list`.
    #[must_use]
    pub fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }
}

/// `tools/list` entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    /// Tool name.
    pub name: String,
    /// Tool description.
    pub description: String,
    /// Argument schema.
    pub input_schema: Value,
}

/// Immutable name-to-tool table, in registration order.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<ToolDefinition>,
}

impl ToolRegistry {
    /// Build a registry. Later duplicates of a name are dropped with a warning.
    #[must_use]
    pub fn new(definitions: Vec<ToolDefinition>) -> Self {
        let mut tools: Vec<ToolDefinition> = Vec::with_capacity(definitions.len());
        for def in definitions {
            if tools.iter().any(|t| t.name == def.name) {
                warn!(tool = def.name, "duplicate tool name, keeping first registration");
                continue;
            }
            tools.push(def);
        }
        Self { tools }
    }

    /// Registry with the built-in shell tools.
    #[must_use]
    pub fn builtin(shell: &Arc<ShellManager>) -> Self {
        Self::new(vec![
            bash::BashTool::definition(Arc::clone(shell)),
            cd::CdTool::definition(Arc::clone(shell)),
        ])
    }

    /// Exact-name lookup.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// All tools in registration order.
    #[must_use]
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools.iter().map(ToolDefinition::descriptor).collect()
    }

    /// Number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether no tools are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Deserialize a handler's `arguments`, mapping failures to `AppError::Tool`.
///
/// # Errors
///
/// Returns `AppError::Tool` when `input` does not match `T`.
pub fn parse_input<T: serde::de::DeserializeOwned>(tool: &str, input: &Value) -> Result<T> {
    serde_json::from_value(input.clone())
        .map_err(|err| crate::AppError::Tool(format!("invalid arguments for {tool}: {err}")))
}
