use chrono::{DateTime, Utc};
use relay_llm::{Message, ToolCallData, Usage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Display};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnState {
    AwaitingProviderResponse,
    DispatchingTools,
    Finalized,
    Aborted,
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingProviderResponse => "AWAITING_PROVIDER_RESPONSE",
            Self::DispatchingTools => "DISPATCHING_TOOLS",
            Self::Finalized => "FINALIZED",
            Self::Aborted => "ABORTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Aborted)
    }

    pub fn can_transition_to(&self, next: &TurnState) -> bool {
        if *next == TurnState::Aborted {
            return !self.is_terminal();
        }

        match self {
            TurnState::AwaitingProviderResponse => {
                matches!(next, TurnState::DispatchingTools | TurnState::Finalized)
            }
            TurnState::DispatchingTools => matches!(
                next,
                TurnState::AwaitingProviderResponse | TurnState::Finalized
            ),
            TurnState::Finalized | TurnState::Aborted => false,
        }
    }
}

impl Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool call as issued to the dispatcher. Never mutated after issue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IssuedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    pub turn_id: String,
}

impl IssuedToolCall {
    /// Unparseable raw arguments are kept as a string so that argument
    /// validation rejects them with an error result.
    pub fn from_provider(call: &ToolCallData, turn_id: &str) -> Self {
        let arguments = crate::tools::parse_tool_arguments(call).unwrap_or_else(|_| {
            Value::String(call.raw_arguments.clone().unwrap_or_default())
        });
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments,
            turn_id: turn_id.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolResultStatus {
    Ok,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResultRecord {
    pub call_id: String,
    pub status: ToolResultStatus,
    pub payload: Value,
    pub produced_at: DateTime<Utc>,
}

impl ToolResultRecord {
    pub fn ok(call_id: impl Into<String>, payload: Value) -> Self {
        Self {
            call_id: call_id.into(),
            status: ToolResultStatus::Ok,
            payload,
            produced_at: Utc::now(),
        }
    }

    pub fn error(call_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            status: ToolResultStatus::Error,
            payload: Value::String(message.into()),
            produced_at: Utc::now(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == ToolResultStatus::Error
    }

    pub fn to_message(&self) -> Message {
        Message::tool_result(self.call_id.clone(), self.payload.clone(), self.is_error())
    }
}

/// One request/response cycle, owned by the executor task that runs it.
#[derive(Clone, Debug)]
pub struct Turn {
    pub id: String,
    pub conversation_id: String,
    pub messages: Vec<Message>,
    pub tool_results: Vec<ToolResultRecord>,
    pub iteration: usize,
    pub usage: Usage,
    state: TurnState,
}

impl Turn {
    pub fn new(conversation_id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            messages,
            tool_results: Vec::new(),
            iteration: 0,
            usage: Usage::default(),
            state: TurnState::AwaitingProviderResponse,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn transition_to(&mut self, next: TurnState) -> Result<(), crate::AgentError> {
        if !self.state.can_transition_to(&next) {
            return Err(crate::AgentError::invalid_transition(self.state, next));
        }
        self.state = next;
        Ok(())
    }

    /// Appends a whole round of results. Callers pass them in issue order.
    pub fn append_results(&mut self, results: Vec<ToolResultRecord>) {
        for result in results {
            self.messages.push(result.to_message());
            self.tool_results.push(result);
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub turn_id: String,
    pub reply: String,
    pub state: TurnState,
    pub iterations: usize,
    pub tool_call_count: usize,
    pub tool_error_count: usize,
    /// True when the reply was produced by a loop guard or provider
    /// exhaustion rather than by the model.
    pub degraded: bool,
    pub provider: Option<String>,
    pub usage: Usage,
}
