use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

pub type RunId = String;
pub type ConversationId = String;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Stopped,
    /// Assigned only by the startup reconciliation pass to runs that were
    /// in flight when the process went down.
    Interrupted,
}

impl RunStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::Interrupted => "interrupted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Stopped | Self::Interrupted
        )
    }

    /// Queued runs hold a concurrency slot as well: admission reserves the
    /// slot before the run is started.
    pub fn occupies_slot(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupMode {
    #[default]
    Discard,
    Keep,
}

impl CleanupMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "discard" | "delete" => Some(Self::Discard),
            "keep" => Some(Self::Keep),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubagentRun {
    pub id: RunId,
    pub parent_conversation_id: ConversationId,
    pub child_conversation_id: ConversationId,
    pub task: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub model_override: Option<String>,
    #[serde(default)]
    pub thinking_override: Option<String>,
    pub cleanup_mode: CleanupMode,
    pub status: RunStatus,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub archive_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub archived: bool,
}

impl SubagentRun {
    pub fn new(
        id: impl Into<RunId>,
        parent_conversation_id: impl Into<ConversationId>,
        child_conversation_id: impl Into<ConversationId>,
        task: impl Into<String>,
        cleanup_mode: CleanupMode,
    ) -> Self {
        Self {
            id: id.into(),
            parent_conversation_id: parent_conversation_id.into(),
            child_conversation_id: child_conversation_id.into(),
            task: task.into(),
            label: None,
            model_override: None,
            thinking_override: None,
            cleanup_mode,
            status: RunStatus::Queued,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            archive_at: None,
            archived: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderState {
    pub provider_id: String,
    /// Manual switch, only changed by an operator.
    pub enabled: bool,
    /// Set by the runtime after an authentication or billing failure.
    pub auto_disabled: bool,
    #[serde(default)]
    pub disabled_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProviderState {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            enabled: true,
            auto_disabled: false,
            disabled_reason: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_eligible(&self) -> bool {
        self.enabled && !self.auto_disabled
    }
}
