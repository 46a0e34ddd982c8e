//! `cd` tool: change the persistent shell's working directory.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::{parse_input, ToolCall, ToolDefinition, ToolFuture, ToolHandler, ToolOutput};
use crate::shell::ShellManager;

/// Registered tool name.
pub const NAME: &str = "cd";

#[derive(Debug, Deserialize)]
struct CdInput {
    path: PathBuf,
}

/// Handler backed by the shared [`ShellManager`].
#[derive(Debug)]
pub struct CdTool {
    shell: Arc<ShellManager>,
}

impl CdTool {
    /// Registry entry for this tool.
    #[must_use]
    pub fn definition(shell: Arc<ShellManager>) -> ToolDefinition {
        ToolDefinition::new(
            NAME,
            "Change the working directory of the persistent shell. Relative paths resolve \
             against the server's directory.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Target directory" }
                },
                "required": ["path"]
            }),
            Arc::new(Self { shell }),
        )
    }
}

impl ToolHandler for CdTool {
    fn call(&self, call: ToolCall) -> ToolFuture<'_> {
        Box::pin(async move {
            let input: CdInput = parse_input(NAME, &call.input)?;

            match self.shell.set_cwd(&input.path).await {
                Ok(cwd) => {
                    info!(
                        call_id = call.call_id,
                        cwd = %cwd.display(),
                        "working directory changed"
                    );
                    let cwd = cwd.to_string_lossy().into_owned();
                    let rendered = format!("Working directory: {cwd}");
                    Ok(ToolOutput::text(json!({ "cwd": cwd }), rendered))
                }
                Err(err) => Ok(ToolOutput::error(err.to_string())),
            }
        })
    }
}
