//! `bash` tool: run a command in the persistent shell.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{parse_input, ToolCall, ToolDefinition, ToolFuture, ToolHandler, ToolOutput};
use crate::shell::{ExecOutput, ShellManager};
use crate::AppError;

/// Registered tool name.
pub const NAME: &str = "bash";

const DESCRIPTION: &str = "Run a command in a persistent bash session. The working directory \
     and exported environment carry over between calls. Commands run one at a time, in order.";

#[derive(Debug, Deserialize)]
struct BashInput {
    command: String,
    /// Milliseconds.
    #[serde(default)]
    timeout: Option<u64>,
}

/// Handler backed by the shared [`ShellManager`].
#[derive(Debug)]
pub struct BashTool {
    shell: Arc<ShellManager>,
}

impl BashTool {
    /// Registry entry for this tool.
    #[must_use]
    pub fn definition(shell: Arc<ShellManager>) -> ToolDefinition {
        ToolDefinition::new(
            NAME,
            DESCRIPTION,
            json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "The command to run" },
                    "timeout": {
                        "type": "integer",
                        "minimum": 1,
                        "description": "Optional timeout in milliseconds"
                    }
                },
                "required": ["command"]
            }),
            Arc::new(Self { shell }),
        )
    }

    fn effective_timeout(&self, requested: Option<u64>) -> Option<Duration> {
        let max = self.shell.config().max_timeout_ms;
        requested.map(|ms| {
            if ms > max {
                warn!(requested_ms = ms, max_ms = max, "clamping command timeout");
            }
            Duration::from_millis(ms.clamp(1, max))
        })
    }
}

impl ToolHandler for BashTool {
    fn call(&self, call: ToolCall) -> ToolFuture<'_> {
        Box::pin(async move {
            let input: BashInput = parse_input(NAME, &call.input)?;
            let timeout = self.effective_timeout(input.timeout);
            debug!(call_id = call.call_id, ?timeout, "running bash command");

            match self
                .shell
                .exec(&input.command, Some(call.cancel), timeout)
                .await
            {
                Ok(output) => {
                    let rendered = render(&output);
                    let data = serde_json::to_value(&output)
                        .map_err(|err| AppError::Tool(format!("cannot encode output: {err}")))?;
                    Ok(ToolOutput::text(data, rendered))
                }
                Err(err) => {
                    warn!(call_id = call.call_id, %err, "bash command failed to run");
                    Ok(ToolOutput::error(err.to_string()))
                }
            }
        })
    }
}

/// Text shown to the model: stdout, stderr, then the exit status.
#[must_use]
pub fn render(output: &ExecOutput) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(4);

    let stdout = output.stdout.trim_end();
    if !stdout.is_empty() {
        parts.push(stdout.to_owned());
    }
    let stderr = output.stderr.trim_end();
    if !stderr.is_empty() {
        parts.push(stderr.to_owned());
    }

    parts.push(format!("Exit code: {}", output.code));
    if output.interrupted {
        parts.push("Command was interrupted".to_owned());
    }

    parts.join("\n")
}
