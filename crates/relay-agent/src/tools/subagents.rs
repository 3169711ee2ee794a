use relay_llm::{Message, Role, ToolDefinition};
use relay_store::CleanupMode;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use super::{
    AGENT_HISTORY_TOOL, LIST_AGENTS_TOOL, RegisteredTool, SEND_INPUT_TOOL, SPAWN_AGENT_TOOL,
    STOP_AGENT_TOOL, optional_string_argument, optional_u64_argument, required_string_argument,
    to_json_output,
};
use crate::ToolError;
use crate::subagents::SpawnRequest;

/// Upper bound for `send_input` waits.
const MAX_WAIT_SECS: u64 = 600;

pub(super) fn spawn_agent_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: SPAWN_AGENT_TOOL.to_string(),
            description: "Spawn a subagent that works on a task in its own conversation and \
                announces the result here when it finishes. Returns immediately."
                .to_string(),
            parameters: json!({
                "type": "object",
                "required": ["task"],
                "properties": {
                    "task": { "type": "string" },
                    "label": { "type": "string" },
                    "model": { "type": "string" },
                    "thinking": { "type": "string" },
                    "cleanup": { "type": "string", "enum": ["discard", "keep"] }
                },
                "additionalProperties": false
            }),
        },
        executor: Arc::new(|args, ctx| {
            Box::pin(async move {
                let task = required_string_argument(&args, "task")?;
                let cleanup_mode = match optional_string_argument(&args, "cleanup")? {
                    Some(value) => CleanupMode::parse(&value).ok_or_else(|| {
                        ToolError::Validation(format!("unknown cleanup mode '{value}'"))
                    })?,
                    None => CleanupMode::default(),
                };
                let request = SpawnRequest {
                    parent_conversation_id: ctx.conversation_id.clone(),
                    task,
                    label: optional_string_argument(&args, "label")?,
                    model_override: optional_string_argument(&args, "model")?,
                    thinking_override: optional_string_argument(&args, "thinking")?,
                    cleanup_mode,
                };

                let outcome = ctx.services.subagents()?.spawn(request).await?;
                to_json_output(&outcome)
            })
        }),
    }
}

pub(super) fn list_agents_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: LIST_AGENTS_TOOL.to_string(),
            description: "List subagent runs spawned from this conversation with their status."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        },
        executor: Arc::new(|_args, ctx| {
            Box::pin(async move {
                let runs = ctx
                    .services
                    .subagents()?
                    .list(Some(ctx.conversation_id.as_str()))
                    .await?;
                to_json_output(&runs)
            })
        }),
    }
}

#[derive(Serialize)]
struct HistoryEntry {
    role: Role,
    text: String,
}

pub(super) fn agent_history_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: AGENT_HISTORY_TOOL.to_string(),
            description: "Show the messages of a subagent's conversation in order.".to_string(),
            parameters: json!({
                "type": "object",
                "required": ["run_id"],
                "properties": {
                    "run_id": { "type": "string" }
                },
                "additionalProperties": false
            }),
        },
        executor: Arc::new(|args, ctx| {
            Box::pin(async move {
                let run_id = required_string_argument(&args, "run_id")?;
                let messages = ctx.services.subagents()?.history(&run_id).await?;
                let entries: Vec<HistoryEntry> = messages.iter().map(history_entry).collect();
                to_json_output(&entries)
            })
        }),
    }
}

pub(super) fn send_input_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: SEND_INPUT_TOOL.to_string(),
            description: "Send a message to a subagent. With wait_seconds, wait up to that long \
                for its reply."
                .to_string(),
            parameters: json!({
                "type": "object",
                "required": ["run_id", "message"],
                "properties": {
                    "run_id": { "type": "string" },
                    "message": { "type": "string" },
                    "wait_seconds": { "type": "integer" }
                },
                "additionalProperties": false
            }),
        },
        executor: Arc::new(|args, ctx| {
            Box::pin(async move {
                let run_id = required_string_argument(&args, "run_id")?;
                let message = required_string_argument(&args, "message")?;
                let wait = optional_u64_argument(&args, "wait_seconds")?
                    .map(|secs| Duration::from_secs(secs.min(MAX_WAIT_SECS)));

                let outcome = ctx
                    .services
                    .subagents()?
                    .send(&run_id, &message, wait)
                    .await?;
                to_json_output(&outcome)
            })
        }),
    }
}

pub(super) fn stop_agent_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: STOP_AGENT_TOOL.to_string(),
            description: "Stop a running subagent and kill the commands it started.".to_string(),
            parameters: json!({
                "type": "object",
                "required": ["run_id"],
                "properties": {
                    "run_id": { "type": "string" }
                },
                "additionalProperties": false
            }),
        },
        executor: Arc::new(|args, ctx| {
            Box::pin(async move {
                let run_id = required_string_argument(&args, "run_id")?;
                let outcome = ctx.services.subagents()?.stop(&run_id).await?;
                to_json_output(&outcome)
            })
        }),
    }
}

fn history_entry(message: &Message) -> HistoryEntry {
    let mut text = message.text();
    for call in message.tool_calls() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&format!("[tool call {}] {}", call.name, call.arguments));
    }
    if text.is_empty() {
        if let Some(call_id) = &message.tool_call_id {
            text = format!("[tool result for {call_id}]");
        }
    }
    HistoryEntry {
        role: message.role,
        text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_llm::{ContentPart, ToolCallData};

    #[test]
    fn history_entry_renders_tool_calls_and_results() {
        let call = Message {
            role: Role::Assistant,
            content: vec![ContentPart::tool_call(ToolCallData {
                id: "c1".to_string(),
                name: "exec".to_string(),
                arguments: json!({"command": "ls"}),
                raw_arguments: None,
            })],
            tool_call_id: None,
        };
        let entry = history_entry(&call);
        assert_eq!(entry.text, r#"[tool call exec] {"command":"ls"}"#);

        let result = history_entry(&Message::tool_result("c1", json!("ok"), false));
        assert_eq!(result.role, Role::Tool);
        assert_eq!(result.text, "[tool result for c1]");
    }
}
