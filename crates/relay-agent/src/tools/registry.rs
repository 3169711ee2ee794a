use super::ToolContext;
use crate::events::{EventEmitter, EventKind, RuntimeEvent, emit_quiet};
use crate::truncation::truncate_tool_output;
use crate::turn::{IssuedToolCall, ToolResultRecord};
use crate::{AgentError, ExecError};
use futures::future::join_all;
use relay_llm::ToolDefinition;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<String, AgentError>> + Send>>;
pub type ToolExecutor = Arc<dyn Fn(Value, ToolContext) -> ToolFuture + Send + Sync>;

#[derive(Clone)]
pub struct RegisteredTool {
    pub definition: ToolDefinition,
    pub executor: ToolExecutor,
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn register(&mut self, tool: RegisteredTool) {
        self.tools.insert(tool.definition.name.clone(), tool);
    }

    pub fn unregister(&mut self, name: &str) -> Option<RegisteredTool> {
        self.tools.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| tool.definition.clone())
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Dispatches one provider round. Results come back in issue order
    /// whether or not the calls ran concurrently.
    pub async fn dispatch(
        &self,
        tool_calls: Vec<IssuedToolCall>,
        context: &ToolContext,
        output_limits: &HashMap<String, usize>,
        event_emitter: &dyn EventEmitter,
        parallel: bool,
    ) -> Vec<ToolResultRecord> {
        if parallel && tool_calls.len() > 1 {
            let futures = tool_calls.into_iter().map(|tool_call| {
                self.dispatch_single(tool_call, context, output_limits, event_emitter)
            });
            return join_all(futures).await;
        }

        let mut results = Vec::with_capacity(tool_calls.len());
        for tool_call in tool_calls {
            results.push(
                self.dispatch_single(tool_call, context, output_limits, event_emitter)
                    .await,
            );
        }
        results
    }

    async fn dispatch_single(
        &self,
        tool_call: IssuedToolCall,
        context: &ToolContext,
        output_limits: &HashMap<String, usize>,
        event_emitter: &dyn EventEmitter,
    ) -> ToolResultRecord {
        let conversation_id = context.conversation_id.as_str();
        let start_time = std::time::Instant::now();

        emit_quiet(
            event_emitter,
            RuntimeEvent::new(EventKind::ToolCallStart, Some(conversation_id))
                .with("call_id", tool_call.id.clone())
                .with("tool", tool_call.name.clone())
                .with("arguments", tool_call.arguments.clone()),
        );

        let Some(registered) = self.get(&tool_call.name) else {
            let message = format!("Unknown tool: {}", tool_call.name);
            return finish_error(event_emitter, context, &tool_call, message, start_time);
        };

        if let Err(error) =
            super::validate_tool_arguments(&registered.definition.parameters, &tool_call.arguments)
        {
            return finish_error(
                event_emitter,
                context,
                &tool_call,
                error.to_string(),
                start_time,
            );
        }

        let call_context = ToolContext {
            call_id: tool_call.id.clone(),
            ..context.clone()
        };
        tracing::debug!(
            conversation_id,
            turn_id = %tool_call.turn_id,
            call_id = %tool_call.id,
            tool = %tool_call.name,
            "dispatching tool call"
        );

        let raw_output =
            match (registered.executor)(tool_call.arguments.clone(), call_context).await {
                Ok(output) => output,
                Err(error) => {
                    let message = match &error {
                        AgentError::Exec(ExecError::AllowlistDenied(reason)) => {
                            format!("Command denied: {reason}. Nothing was executed.")
                        }
                        other => other.to_string(),
                    };
                    return finish_error(event_emitter, context, &tool_call, message, start_time);
                }
            };

        let truncated = truncate_tool_output(&raw_output, &tool_call.name, output_limits);
        emit_quiet(
            event_emitter,
            RuntimeEvent::new(EventKind::ToolCallEnd, Some(conversation_id))
                .with("call_id", tool_call.id.clone())
                .with("tool", tool_call.name.clone())
                .with("duration_ms", start_time.elapsed().as_millis() as u64)
                .with("is_error", false),
        );

        ToolResultRecord::ok(tool_call.id, Value::String(truncated))
    }
}

fn finish_error(
    event_emitter: &dyn EventEmitter,
    context: &ToolContext,
    tool_call: &IssuedToolCall,
    message: String,
    start_time: std::time::Instant,
) -> ToolResultRecord {
    tracing::debug!(
        conversation_id = %context.conversation_id,
        call_id = %tool_call.id,
        tool = %tool_call.name,
        error = %message,
        "tool call failed"
    );
    emit_quiet(
        event_emitter,
        RuntimeEvent::new(EventKind::ToolCallEnd, Some(&context.conversation_id))
            .with("call_id", tool_call.id.clone())
            .with("tool", tool_call.name.clone())
            .with("duration_ms", start_time.elapsed().as_millis() as u64)
            .with("is_error", true)
            .with("error", message.clone()),
    );
    ToolResultRecord::error(tool_call.id.clone(), message)
}
