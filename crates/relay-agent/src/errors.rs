use relay_llm::ProviderError;
use relay_store::StoreError;
use thiserror::Error;

/// Top-level error type for the relay-agent crate.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Subagent(#[from] SubagentError),
    #[error("no provider available")]
    NoProviderAvailable,
    #[error("provider `{0}` is not part of the configured chain")]
    UnknownProvider(String),
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },
    #[error("turn cancelled")]
    Cancelled,
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures that are reported back to the model as an error tool result
/// instead of ending the turn.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("tool validation failed: {0}")]
    Validation(String),
    #[error("tool execution failed: {0}")]
    Execution(String),
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("command denied by allowlist: {0}")]
    AllowlistDenied(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session {0} is not running")]
    SessionNotRunning(String),
    #[error("session {0} has not exited yet; kill it before removing")]
    SessionNotTerminal(String),
    #[error("failed to spawn command: {0}")]
    Spawn(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubagentError {
    #[error("subagent run not found: {0}")]
    RunNotFound(String),
    #[error("subagent run {0} has been archived")]
    RunArchived(String),
    #[error("subagent run {run_id} is {status} and cannot accept input")]
    RunNotActive { run_id: String, status: String },
    #[error("subagent depth limit of {0} reached; nested spawning is blocked")]
    DepthExceeded(usize),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl AgentError {
    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}
