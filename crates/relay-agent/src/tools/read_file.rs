use relay_llm::ToolDefinition;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{READ_FILE_TOOL, RegisteredTool, optional_usize_argument, required_string_argument};
use crate::ToolError;

const DEFAULT_LINE_LIMIT: usize = 2_000;

pub(super) fn read_file_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: READ_FILE_TOOL.to_string(),
            description: "Read a file inside the workspace. Returns line-numbered content."
                .to_string(),
            parameters: json!({
                "type": "object",
                "required": ["file_path"],
                "properties": {
                    "file_path": { "type": "string" },
                    "offset": { "type": "integer" },
                    "limit": { "type": "integer" }
                },
                "additionalProperties": false
            }),
        },
        executor: Arc::new(|args, ctx| {
            Box::pin(async move {
                let file_path = required_string_argument(&args, "file_path")?;
                let offset = optional_usize_argument(&args, "offset")?.unwrap_or(1).max(1);
                let limit = optional_usize_argument(&args, "limit")?.unwrap_or(DEFAULT_LINE_LIMIT);

                let root = &ctx.services.config.exec.workspace_root;
                let path = resolve_in_workspace(root, &file_path).await?;
                let content = tokio::fs::read_to_string(&path).await.map_err(|error| {
                    ToolError::Execution(format!("could not read {}: {error}", path.display()))
                })?;
                Ok(format_line_numbered(&content, offset, limit))
            })
        }),
    }
}

/// Resolves `requested` against `root` and refuses anything that escapes it,
/// including through symlinks.
async fn resolve_in_workspace(root: &Path, requested: &str) -> Result<PathBuf, ToolError> {
    let root = tokio::fs::canonicalize(root).await.map_err(|error| {
        ToolError::Execution(format!("workspace root is unavailable: {error}"))
    })?;
    let candidate = Path::new(requested);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };
    let resolved = tokio::fs::canonicalize(&joined)
        .await
        .map_err(|error| ToolError::Execution(format!("could not open {requested}: {error}")))?;
    if !resolved.starts_with(&root) {
        return Err(ToolError::Execution(format!(
            "{requested} is outside the workspace"
        )));
    }
    Ok(resolved)
}

fn format_line_numbered(content: &str, offset: usize, limit: usize) -> String {
    let mut lines = content
        .lines()
        .enumerate()
        .skip(offset - 1)
        .take(limit)
        .map(|(index, line)| format!("{:>6}\t{}", index + 1, line))
        .collect::<Vec<_>>()
        .join("\n");
    if lines.is_empty() {
        lines = format!("(no content at line {offset})");
    }
    lines
}
