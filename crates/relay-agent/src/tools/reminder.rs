use relay_llm::ToolDefinition;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use super::{RegisteredTool, SCHEDULE_REMINDER_TOOL, required_string_argument, to_json_output};
use crate::ToolError;

/// Thirty days.
const MAX_DELAY_SECS: u64 = 30 * 24 * 60 * 60;

pub(super) fn schedule_reminder_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition {
            name: SCHEDULE_REMINDER_TOOL.to_string(),
            description: "Schedule a reminder that is posted back into this conversation \
                after the given delay."
                .to_string(),
            parameters: json!({
                "type": "object",
                "required": ["text", "delay_seconds"],
                "properties": {
                    "text": { "type": "string" },
                    "delay_seconds": { "type": "integer" }
                },
                "additionalProperties": false
            }),
        },
        executor: Arc::new(|args, ctx| {
            Box::pin(async move {
                let text = required_string_argument(&args, "text")?;
                let delay_seconds = super::optional_u64_argument(&args, "delay_seconds")?
                    .ok_or_else(|| {
                        ToolError::Validation("missing required argument 'delay_seconds'".into())
                    })?;
                if delay_seconds > MAX_DELAY_SECS {
                    return Err(ToolError::Validation(format!(
                        "delay_seconds must be at most {MAX_DELAY_SECS}"
                    ))
                    .into());
                }

                let reminder = ctx.services.reminders.schedule(
                    &ctx.conversation_id,
                    &text,
                    Duration::from_secs(delay_seconds),
                )?;
                to_json_output(&reminder)
            })
        }),
    }
}
