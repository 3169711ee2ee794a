mod exec;
mod read_file;
mod registry;
mod reminder;
mod subagents;

use crate::config::AgentConfig;
use crate::conversation::ConversationStore;
use crate::exec::ExecSessionManager;
use crate::reminders::ReminderScheduler;
use crate::subagents::SubagentOrchestrator;
use crate::{AgentError, ToolError};
use relay_llm::ToolCallData;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, OnceLock, Weak};

pub use registry::{RegisteredTool, ToolExecutor, ToolFuture, ToolRegistry};

pub const EXEC_TOOL: &str = "exec";
pub const PROCESS_TOOL: &str = "process";
pub const READ_FILE_TOOL: &str = "read_file";
pub const SCHEDULE_REMINDER_TOOL: &str = "schedule_reminder";
pub const SPAWN_AGENT_TOOL: &str = "spawn_agent";
pub const LIST_AGENTS_TOOL: &str = "list_agents";
pub const AGENT_HISTORY_TOOL: &str = "agent_history";
pub const SEND_INPUT_TOOL: &str = "send_input";
pub const STOP_AGENT_TOOL: &str = "stop_agent";

/// Runtime components tool handlers act on.
pub struct ToolServices {
    pub config: Arc<AgentConfig>,
    pub exec: ExecSessionManager,
    pub conversations: Arc<ConversationStore>,
    pub reminders: Arc<ReminderScheduler>,
    subagents: OnceLock<Weak<SubagentOrchestrator>>,
}

impl ToolServices {
    pub fn new(
        config: Arc<AgentConfig>,
        exec: ExecSessionManager,
        conversations: Arc<ConversationStore>,
        reminders: Arc<ReminderScheduler>,
    ) -> Self {
        Self {
            config,
            exec,
            conversations,
            reminders,
            subagents: OnceLock::new(),
        }
    }

    /// The orchestrator is built after the executor that owns these
    /// services, so it is attached once at wiring time.
    pub fn attach_subagents(&self, orchestrator: &Arc<SubagentOrchestrator>) {
        let _ = self.subagents.set(Arc::downgrade(orchestrator));
    }

    pub fn subagents(&self) -> Result<Arc<SubagentOrchestrator>, ToolError> {
        self.subagents
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| ToolError::Execution("subagents are not available".to_string()))
    }
}

/// Per-call context handed to every tool handler.
#[derive(Clone)]
pub struct ToolContext {
    pub conversation_id: String,
    pub turn_id: String,
    pub call_id: String,
    pub services: Arc<ToolServices>,
}

pub fn build_default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::default();
    register_exec_tools(&mut registry);
    registry.register(read_file::read_file_tool());
    registry.register(reminder::schedule_reminder_tool());
    register_subagent_tools(&mut registry);
    registry
}

pub fn register_exec_tools(registry: &mut ToolRegistry) {
    registry.register(exec::exec_tool());
    registry.register(exec::process_tool());
}

pub fn register_subagent_tools(registry: &mut ToolRegistry) {
    registry.register(subagents::spawn_agent_tool());
    registry.register(subagents::list_agents_tool());
    registry.register(subagents::agent_history_tool());
    registry.register(subagents::send_input_tool());
    registry.register(subagents::stop_agent_tool());
}

fn required_string_argument(arguments: &Value, key: &str) -> Result<String, ToolError> {
    optional_string_argument(arguments, key)?
        .ok_or_else(|| ToolError::Validation(format!("missing required argument '{}'", key)))
}

fn optional_string_argument(arguments: &Value, key: &str) -> Result<Option<String>, ToolError> {
    let Some(value) = arguments.get(key) else {
        return Ok(None);
    };
    if value.is_null() {
        return Ok(None);
    }
    let Some(value) = value.as_str() else {
        return Err(ToolError::Validation(format!(
            "argument '{}' must be a string",
            key
        )));
    };
    Ok(Some(value.to_string()))
}

fn optional_bool_argument(arguments: &Value, key: &str) -> Result<Option<bool>, ToolError> {
    let Some(value) = arguments.get(key) else {
        return Ok(None);
    };
    let Some(value) = value.as_bool() else {
        return Err(ToolError::Validation(format!(
            "argument '{}' must be a boolean",
            key
        )));
    };
    Ok(Some(value))
}

fn optional_u64_argument(arguments: &Value, key: &str) -> Result<Option<u64>, ToolError> {
    let Some(value) = arguments.get(key) else {
        return Ok(None);
    };
    let Some(value) = value.as_u64() else {
        return Err(ToolError::Validation(format!(
            "argument '{}' must be a positive integer",
            key
        )));
    };
    Ok(Some(value))
}

fn optional_usize_argument(arguments: &Value, key: &str) -> Result<Option<usize>, ToolError> {
    Ok(optional_u64_argument(arguments, key)?.map(|value| value as usize))
}

fn to_json_output<T: Serialize>(value: &T) -> Result<String, AgentError> {
    serde_json::to_string_pretty(value)
        .map_err(|error| ToolError::Execution(format!("failed to encode tool output: {error}")).into())
}

pub(crate) fn parse_tool_arguments(tool_call: &ToolCallData) -> Result<Value, ToolError> {
    if let Some(raw_arguments) = &tool_call.raw_arguments {
        let parsed = serde_json::from_str::<Value>(raw_arguments).map_err(|error| {
            ToolError::Validation(format!(
                "invalid JSON arguments for tool '{}': {}",
                tool_call.name, error
            ))
        })?;
        return Ok(parsed);
    }

    if tool_call.arguments.is_null() {
        return Ok(Value::Object(Default::default()));
    }
    Ok(tool_call.arguments.clone())
}

fn validate_tool_arguments(schema: &Value, arguments: &Value) -> Result<(), ToolError> {
    let object = arguments
        .as_object()
        .ok_or_else(|| ToolError::Validation("tool arguments must be a JSON object".to_string()))?;

    let schema_object = schema.as_object().ok_or_else(|| {
        ToolError::Validation("tool schema root must be a JSON object".to_string())
    })?;

    if let Some(required) = schema_object.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(key) {
                return Err(ToolError::Validation(format!(
                    "missing required argument '{}'",
                    key
                )));
            }
        }
    }

    let properties = schema_object
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let additional_allowed = schema_object
        .get("additionalProperties")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    for (key, value) in object {
        let Some(property) = properties.get(key) else {
            if additional_allowed {
                continue;
            }
            return Err(ToolError::Validation(format!(
                "unexpected argument '{}' not allowed by schema",
                key
            )));
        };

        if let Some(type_name) = property.get("type").and_then(Value::as_str) {
            let is_valid = match type_name {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };

            if !is_valid {
                return Err(ToolError::Validation(format!(
                    "argument '{}' expected type '{}' but received '{}'",
                    key,
                    type_name,
                    json_type_name(value)
                )));
            }
        }

        if let Some(allowed) = property.get("enum").and_then(Value::as_array) {
            if !allowed.contains(value) {
                return Err(ToolError::Validation(format!(
                    "argument '{}' must be one of {}",
                    key,
                    Value::Array(allowed.clone())
                )));
            }
        }
    }

    Ok(())
}

fn json_type_name(value: &Value) -> &'static str {
    if value.is_null() {
        "null"
    } else if value.is_boolean() {
        "boolean"
    } else if value.is_string() {
        "string"
    } else if value.is_number() {
        "number"
    } else if value.is_array() {
        "array"
    } else {
        "object"
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::allowlist::{BinaryResolver, CommandGate, FeatureAllowlist};
    use crate::channel::NoopChannel;
    use crate::events::NoopEventEmitter;

    pub(crate) fn tool_services(config: AgentConfig) -> Arc<ToolServices> {
        let config = Arc::new(config);
        let emitter = Arc::new(NoopEventEmitter);
        let gate = CommandGate::new(
            Arc::new(FeatureAllowlist::from_config(&config.exec)),
            BinaryResolver::from_config(&config.exec),
        );
        let exec = ExecSessionManager::new(config.exec.clone(), gate, emitter.clone());
        let conversations = Arc::new(ConversationStore::new());
        let reminders = Arc::new(ReminderScheduler::new(
            conversations.clone(),
            Arc::new(NoopChannel),
            emitter,
        ));
        Arc::new(ToolServices::new(config, exec, conversations, reminders))
    }

    pub(crate) fn tool_context(conversation_id: &str) -> ToolContext {
        ToolContext {
            conversation_id: conversation_id.to_string(),
            turn_id: "turn-1".to_string(),
            call_id: String::new(),
            services: tool_services(AgentConfig::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_tool_arguments_reports_missing_required_key() {
        let schema = json!({
            "type": "object",
            "required": ["command"],
            "properties": { "command": { "type": "string" } }
        });
        let error = validate_tool_arguments(&schema, &json!({}))
            .expect_err("missing key should fail");
        assert_eq!(
            error,
            ToolError::Validation("missing required argument 'command'".to_string())
        );
    }

    #[test]
    fn validate_tool_arguments_rejects_wrong_types_and_extra_keys() {
        let schema = json!({
            "type": "object",
            "properties": { "yield_ms": { "type": "integer" } },
            "additionalProperties": false
        });
        assert!(validate_tool_arguments(&schema, &json!({"yield_ms": "soon"})).is_err());
        assert!(validate_tool_arguments(&schema, &json!({"other": 1})).is_err());
        assert!(validate_tool_arguments(&schema, &json!({"yield_ms": 10})).is_ok());
    }

    #[test]
    fn validate_tool_arguments_checks_enum_members() {
        let schema = json!({
            "type": "object",
            "properties": { "action": { "type": "string", "enum": ["list", "poll"] } }
        });
        assert!(validate_tool_arguments(&schema, &json!({"action": "poll"})).is_ok());
        assert!(validate_tool_arguments(&schema, &json!({"action": "nuke"})).is_err());
    }

    #[test]
    fn parse_tool_arguments_prefers_raw_json_text() {
        let call = ToolCallData {
            id: "c1".to_string(),
            name: "exec".to_string(),
            arguments: Value::Null,
            raw_arguments: Some(r#"{"command":"ls"}"#.to_string()),
        };
        assert_eq!(
            parse_tool_arguments(&call).expect("parse"),
            json!({"command": "ls"})
        );

        let broken = ToolCallData {
            raw_arguments: Some("{not json".to_string()),
            ..call
        };
        assert!(parse_tool_arguments(&broken).is_err());
    }

    #[test]
    fn default_registry_exposes_every_runtime_tool() {
        let names = build_default_registry().names();
        assert_eq!(
            names,
            vec![
                AGENT_HISTORY_TOOL,
                EXEC_TOOL,
                LIST_AGENTS_TOOL,
                PROCESS_TOOL,
                READ_FILE_TOOL,
                SCHEDULE_REMINDER_TOOL,
                SEND_INPUT_TOOL,
                SPAWN_AGENT_TOOL,
                STOP_AGENT_TOOL,
            ]
        );
    }
}
