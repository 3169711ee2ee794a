use crate::AgentError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

pub type EventData = HashMap<String, Value>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TurnStart,
    TurnEnd,
    TurnLimit,
    ProviderSelected,
    ProviderFailover,
    ProviderAutoDisabled,
    ExecFallback,
    ToolCallStart,
    ToolCallEnd,
    ExecSessionStart,
    ExecSessionExit,
    ExecSessionKilled,
    SubagentSpawned,
    SubagentBusy,
    SubagentCompleted,
    SubagentStopped,
    SubagentArchived,
    SubagentInterrupted,
    ReminderFired,
    Warning,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub conversation_id: Option<String>,
    pub data: EventData,
}

impl RuntimeEvent {
    pub fn new(kind: EventKind, conversation_id: Option<&str>) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            conversation_id: conversation_id.map(str::to_string),
            data: EventData::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }
}

pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: RuntimeEvent) -> Result<(), AgentError>;
}

#[derive(Default)]
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit(&self, _event: RuntimeEvent) -> Result<(), AgentError> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct BufferedEventEmitter {
    inner: Arc<Mutex<Vec<RuntimeEvent>>>,
}

impl BufferedEventEmitter {
    pub fn snapshot(&self) -> Vec<RuntimeEvent> {
        self.lock().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.lock().iter().map(|event| event.kind.clone()).collect()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RuntimeEvent>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EventEmitter for BufferedEventEmitter {
    fn emit(&self, event: RuntimeEvent) -> Result<(), AgentError> {
        self.lock().push(event);
        Ok(())
    }
}

/// Emits and swallows emitter failures; observers must never break the runtime.
pub(crate) fn emit_quiet(emitter: &dyn EventEmitter, event: RuntimeEvent) {
    let kind = event.kind.clone();
    if let Err(error) = emitter.emit(event) {
        tracing::debug!(?kind, %error, "event emitter rejected event");
    }
}
