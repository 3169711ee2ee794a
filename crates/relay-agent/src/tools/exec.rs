use relay_llm::ToolDefinition;
use serde_json::{Value, json};
use std::sync::Arc;

use super::{
    EXEC_TOOL, PROCESS_TOOL, RegisteredTool, optional_bool_argument, optional_u64_argument,
    required_string_argument, to_json_output,
};
use crate::ToolError;
use crate::exec::{ExecOutcome, ExecRequest, ProcessAction};

pub(super) fn exec_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: EXEC_TOOL.to_string(),
            description: "Run a shell command on the host. Commands that finish within the \
                yield window return their output; longer ones keep running in a session \
                controlled with the process tool."
                .to_string(),
            parameters: json!({
                "type": "object",
                "required": ["command"],
                "properties": {
                    "command": { "type": "string" },
                    "background": { "type": "boolean" },
                    "yield_ms": { "type": "integer" }
                },
                "additionalProperties": false
            }),
        },
        executor: Arc::new(|args, ctx| {
            Box::pin(async move {
                let command = required_string_argument(&args, "command")?;
                let background = optional_bool_argument(&args, "background")?.unwrap_or(false);
                let yield_ms = optional_u64_argument(&args, "yield_ms")?;

                let request = ExecRequest {
                    background,
                    yield_ms,
                    owner: Some(ctx.conversation_id.clone()),
                    ..ExecRequest::new(command)
                };
                let outcome = ctx.services.exec.exec(request).await?;
                Ok(format_exec_outcome(&outcome))
            })
        }),
    }
}

pub(super) fn process_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: PROCESS_TOOL.to_string(),
            description: "Manage exec sessions: list, poll for new output, read the log, \
                write to stdin, kill, clear the log, or remove a finished session."
                .to_string(),
            parameters: json!({
                "type": "object",
                "required": ["action"],
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": ["list", "poll", "log", "write", "kill", "clear", "remove"]
                    },
                    "session_id": { "type": "string" },
                    "offset": { "type": "integer" },
                    "limit": { "type": "integer" },
                    "data": { "type": "string" },
                    "eof": { "type": "boolean" }
                },
                "additionalProperties": false
            }),
        },
        executor: Arc::new(|args, ctx| {
            Box::pin(async move {
                let action = parse_process_action(args)?;
                let response = ctx.services.exec.process(action).await?;
                to_json_output(&response)
            })
        }),
    }
}

fn parse_process_action(args: Value) -> Result<ProcessAction, ToolError> {
    serde_json::from_value(args)
        .map_err(|error| ToolError::Validation(format!("invalid process action: {error}")))
}

fn format_exec_outcome(outcome: &ExecOutcome) -> String {
    match outcome {
        ExecOutcome::Done { output, exit_code } => {
            let status = match exit_code {
                Some(code) => format!("[exit code: {code}]"),
                None => "[terminated by signal]".to_string(),
            };
            if output.is_empty() {
                status
            } else if output.ends_with('\n') {
                format!("{output}{status}")
            } else {
                format!("{output}\n{status}")
            }
        }
        ExecOutcome::Running { session_id } => format!(
            "Command is still running in session {session_id}. \
             Use the process tool with this session_id to poll, read the log, write input or kill it."
        ),
    }
}
