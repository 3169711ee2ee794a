//! Last-resort command recovery for providers that answer an exec request
//! with prose or raw tool-call text instead of a structured tool call.
//!
//! Two gates must both pass: the user message has to be an explicit exec
//! request, and the provider response has to be malformed. Ordinary
//! conversational turns are never touched.

use regex::Regex;
use relay_llm::ToolCallData;
use serde_json::Value;
use std::sync::LazyLock;

static EXEC_INTENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*(?:please\s+run|run|execute|exec|\$)\s+(\S.*)$")
        .expect("exec intent pattern is valid")
});

static FENCED_SHELL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:sh|bash|shell|console)[ \t]*\r?\n(.*?)```")
        .expect("fenced shell pattern is valid")
});

static DOLLAR_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*\$ (\S.*)$").expect("dollar line pattern is valid"));

static BACKTICKED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`([^`\n]+)`").expect("backtick pattern is valid"));

static TOOL_CALL_MARKUP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<tool_call>\s*(.*?)\s*(?:</tool_call>|$)")
        .expect("tool call markup pattern is valid")
});

/// True only for messages that open with an explicit run/exec verb.
pub fn is_exec_intent(user_message: &str) -> bool {
    EXEC_INTENT.is_match(user_message)
}

/// A response is malformed when it carries neither usable text nor
/// well-formed tool calls.
pub fn is_malformed_response(text: &str, tool_calls: &[ToolCallData]) -> bool {
    if tool_calls.iter().any(|call| call.name.trim().is_empty()) {
        return true;
    }
    if !tool_calls.is_empty() {
        return false;
    }
    let trimmed = text.trim();
    trimmed.is_empty() || TOOL_CALL_MARKUP.is_match(trimmed) || raw_tool_call_json(trimmed).is_some()
}

/// Recovers a command, in order of confidence: a `command` field in raw
/// tool-call JSON, a fenced shell block, a `$ ` line, then the user's own
/// request.
///
/// Prose reaches the fenced-block and `$ ` line sources only next to a
/// nameless tool call or inside `<tool_call>` markup; a plain prose answer
/// is never treated as malformed.
pub fn extract_command(
    response_text: &str,
    tool_calls: &[ToolCallData],
    user_message: &str,
) -> Option<String> {
    json_command(response_text, tool_calls)
        .or_else(|| fenced_command(response_text))
        .or_else(|| {
            DOLLAR_LINE
                .captures(response_text)
                .map(|captures| captures[1].trim().to_string())
        })
        .or_else(|| user_command(user_message))
        .filter(|command| !command.is_empty())
}

fn json_command(response_text: &str, tool_calls: &[ToolCallData]) -> Option<String> {
    for call in tool_calls {
        if let Some(command) = command_field(&call.arguments) {
            return Some(command);
        }
        if let Some(raw) = &call.raw_arguments {
            if let Some(command) = serde_json::from_str::<Value>(raw)
                .ok()
                .and_then(|value| command_field(&value))
            {
                return Some(command);
            }
        }
    }

    let trimmed = response_text.trim();
    let candidate = TOOL_CALL_MARKUP
        .captures(trimmed)
        .map(|captures| captures[1].to_string())
        .unwrap_or_else(|| trimmed.to_string());
    raw_tool_call_json(&candidate).and_then(|value| command_field(&value))
}

fn raw_tool_call_json(text: &str) -> Option<Value> {
    if !text.starts_with('{') {
        return None;
    }
    let value: Value = serde_json::from_str(text).ok()?;
    let object = value.as_object()?;
    ["name", "tool", "function", "command", "arguments"]
        .iter()
        .any(|key| object.contains_key(*key))
        .then_some(value)
}

fn command_field(value: &Value) -> Option<String> {
    if let Some(command) = value.get("command").and_then(Value::as_str) {
        return Some(command.trim().to_string());
    }
    ["arguments", "parameters", "input", "args"]
        .iter()
        .filter_map(|key| value.get(*key))
        .find_map(|nested| match nested {
            Value::String(raw) => serde_json::from_str::<Value>(raw)
                .ok()
                .and_then(|parsed| command_field(&parsed)),
            other => command_field(other),
        })
}

fn fenced_command(text: &str) -> Option<String> {
    let block = FENCED_SHELL.captures(text)?;
    let lines: Vec<&str> = block[1]
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.strip_prefix("$ ").unwrap_or(line))
        .collect();
    (!lines.is_empty()).then(|| lines.join(" && "))
}

fn user_command(user_message: &str) -> Option<String> {
    if let Some(captures) = BACKTICKED.captures(user_message) {
        return Some(captures[1].trim().to_string());
    }
    let captures = EXEC_INTENT.captures(user_message)?;
    let first_line = captures[1].lines().next().unwrap_or_default();
    Some(first_line.trim().to_string())
}
