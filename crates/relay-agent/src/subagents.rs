//! Subagent orchestrator.
//!
//! A spawn creates an isolated child conversation (queue key
//! `subagent:<child id>`) and runs its first turn on a background task. The
//! number of runs holding a slot is checked and reserved under one lock, so
//! concurrent spawns can never over-admit. Completion is announced to the
//! parent conversation and its channel; `keep` runs are archived by timer.

use crate::channel::ChannelDelivery;
use crate::config::SubagentConfig;
use crate::conversation::{ConversationStore, NewConversation};
use crate::events::{EventEmitter, EventKind, RuntimeEvent, emit_quiet};
use crate::exec::ExecSessionManager;
use crate::executor::TurnExecutor;
use crate::turn::{TurnOutcome, TurnState};
use crate::{AgentError, SubagentError};
use chrono::{DateTime, Utc};
use relay_llm::Message;
use relay_store::{CleanupMode, RunStatus, RunStore, SubagentRun};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpawnRequest {
    pub parent_conversation_id: String,
    pub task: String,
    pub label: Option<String>,
    pub model_override: Option<String>,
    pub thinking_override: Option<String>,
    pub cleanup_mode: CleanupMode,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SpawnOutcome {
    Accepted {
        run_id: String,
        child_conversation_id: String,
    },
    /// Rejected at the concurrency cap. No run was created.
    Busy { running: usize, limit: usize },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub parent_conversation_id: String,
    pub child_conversation_id: String,
    pub label: Option<String>,
    pub task: String,
    pub status: RunStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub archived: bool,
}

impl From<&SubagentRun> for RunSummary {
    fn from(run: &SubagentRun) -> Self {
        Self {
            run_id: run.id.clone(),
            parent_conversation_id: run.parent_conversation_id.clone(),
            child_conversation_id: run.child_conversation_id.clone(),
            label: run.label.clone(),
            task: run.task.clone(),
            status: run.status,
            result: run.result.clone(),
            error: run.error.clone(),
            created_at: run.created_at,
            started_at: run.started_at,
            ended_at: run.ended_at,
            archived: run.archived,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SendOutcome {
    Accepted,
    Completed { reply: String },
    Timeout,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    AlreadyTerminal { run_status: RunStatus },
}

pub struct SubagentOrchestrator {
    config: SubagentConfig,
    executor: Arc<TurnExecutor>,
    conversations: Arc<ConversationStore>,
    exec: ExecSessionManager,
    store: Arc<dyn RunStore>,
    channel: Arc<dyn ChannelDelivery>,
    emitter: Arc<dyn EventEmitter>,
    /// Runs holding a concurrency slot, keyed by run id.
    active: Mutex<HashMap<String, CancellationToken>>,
    /// Parents of the tokens handed to follow-up turns started by `send`.
    inputs: Mutex<HashMap<String, CancellationToken>>,
    /// Serializes terminal status writes so stop and completion cannot both win.
    status_gate: tokio::sync::Mutex<()>,
    archive_timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl SubagentOrchestrator {
    pub fn new(
        config: SubagentConfig,
        executor: Arc<TurnExecutor>,
        exec: ExecSessionManager,
        store: Arc<dyn RunStore>,
        channel: Arc<dyn ChannelDelivery>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self {
            config,
            conversations: executor.conversations().clone(),
            executor,
            exec,
            store,
            channel,
            emitter,
            active: Mutex::new(HashMap::new()),
            inputs: Mutex::new(HashMap::new()),
            status_gate: tokio::sync::Mutex::new(()),
            archive_timers: Mutex::new(HashMap::new()),
        }
    }

    pub fn running_count(&self) -> usize {
        self.active().len()
    }

    pub fn limit(&self) -> usize {
        self.config.max_concurrent
    }

    pub async fn spawn(self: &Arc<Self>, request: SpawnRequest) -> Result<SpawnOutcome, AgentError> {
        let parent = self
            .conversations
            .get(&request.parent_conversation_id)
            .ok_or_else(|| AgentError::ConversationNotFound(request.parent_conversation_id.clone()))?;
        if parent.depth >= self.config.max_depth {
            return Err(SubagentError::DepthExceeded(self.config.max_depth).into());
        }

        let run_id = format!("run-{}", Uuid::new_v4().simple());
        let child_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();

        {
            let mut active = self.active();
            if active.len() >= self.config.max_concurrent {
                let running = active.len();
                drop(active);
                tracing::info!(
                    parent_conversation_id = %parent.id,
                    running,
                    limit = self.config.max_concurrent,
                    "subagent spawn rejected: busy"
                );
                emit_quiet(
                    self.emitter.as_ref(),
                    RuntimeEvent::new(EventKind::SubagentBusy, Some(&parent.id))
                        .with("running", running as u64)
                        .with("limit", self.config.max_concurrent as u64),
                );
                return Ok(SpawnOutcome::Busy {
                    running,
                    limit: self.config.max_concurrent,
                });
            }
            active.insert(run_id.clone(), cancel.clone());
        }

        let child = self.conversations.create(NewConversation {
            id: Some(child_id),
            model_override: request.model_override.clone(),
            thinking_override: request.thinking_override.clone(),
            ..NewConversation::child_of(&parent)
        });

        let mut run = SubagentRun::new(
            run_id.clone(),
            parent.id.clone(),
            child.id.clone(),
            request.task.clone(),
            request.cleanup_mode,
        );
        run.label = request.label.clone();
        run.model_override = request.model_override.clone();
        run.thinking_override = request.thinking_override.clone();

        if let Err(error) = self.store.create_run(run.clone()).await {
            self.active().remove(&run_id);
            self.conversations.remove(&child.id);
            return Err(error.into());
        }

        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        if let Err(error) = self.store.update_run(run.clone()).await {
            self.active().remove(&run_id);
            self.conversations.remove(&child.id);
            return Err(error.into());
        }

        tracing::info!(
            run_id = %run_id,
            parent_conversation_id = %parent.id,
            child_conversation_id = %child.id,
            "subagent spawned"
        );
        emit_quiet(
            self.emitter.as_ref(),
            RuntimeEvent::new(EventKind::SubagentSpawned, Some(&parent.id))
                .with("run_id", run_id.clone())
                .with("child_conversation_id", child.id.clone()),
        );

        let orchestrator = self.clone();
        let task = request.task;
        let child_id = child.id.clone();
        tokio::spawn(async move {
            let result = orchestrator
                .executor
                .run_turn_with_cancel(&child_id, &task, cancel)
                .await;
            orchestrator.complete(run, result).await;
        });

        Ok(SpawnOutcome::Accepted {
            run_id,
            child_conversation_id: child.id,
        })
    }

    /// Runs newest last. `parent` narrows the listing to one conversation.
    pub async fn list(&self, parent: Option<&str>) -> Result<Vec<RunSummary>, AgentError> {
        let mut runs = self.store.list_runs().await?;
        runs.retain(|run| parent.is_none_or(|parent| run.parent_conversation_id == parent));
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(runs.iter().map(RunSummary::from).collect())
    }

    pub async fn run(&self, run_id: &str) -> Result<SubagentRun, AgentError> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| SubagentError::RunNotFound(run_id.to_string()).into())
    }

    pub async fn history(&self, run_id: &str) -> Result<Vec<Message>, AgentError> {
        let run = self.run(run_id).await?;
        if run.archived {
            return Err(SubagentError::RunArchived(run_id.to_string()).into());
        }
        self.conversations.messages(&run.child_conversation_id)
    }

    /// Queues a message as a new turn of the child conversation. With a
    /// wait window the caller blocks until the reply or the timeout.
    pub async fn send(
        self: &Arc<Self>,
        run_id: &str,
        message: &str,
        wait: Option<Duration>,
    ) -> Result<SendOutcome, AgentError> {
        let run = self.run(run_id).await?;
        if run.archived {
            return Err(SubagentError::RunArchived(run_id.to_string()).into());
        }
        let accepts_input = matches!(run.status, RunStatus::Running | RunStatus::Completed)
            && self.conversations.contains(&run.child_conversation_id);
        if !accepts_input {
            return Err(SubagentError::RunNotActive {
                run_id: run_id.to_string(),
                status: run.status.label().to_string(),
            }
            .into());
        }

        let cancel = self
            .inputs()
            .entry(run_id.to_string())
            .or_default()
            .child_token();
        let (reply_tx, reply_rx) = oneshot::channel();
        let orchestrator = self.clone();
        let child_id = run.child_conversation_id.clone();
        let message = message.to_string();
        let run_id_owned = run_id.to_string();
        tokio::spawn(async move {
            let result = orchestrator
                .executor
                .run_turn_with_cancel(&child_id, &message, cancel)
                .await;
            match result {
                Ok(outcome) => {
                    let _ = reply_tx.send(outcome.reply);
                }
                Err(error) => {
                    tracing::warn!(run_id = %run_id_owned, %error, "subagent input turn failed");
                }
            }
        });
        tracing::debug!(run_id, "input sent to subagent");

        let Some(wait) = wait else {
            return Ok(SendOutcome::Accepted);
        };
        match tokio::time::timeout(wait, reply_rx).await {
            Ok(Ok(reply)) => Ok(SendOutcome::Completed { reply }),
            Ok(Err(_)) | Err(_) => Ok(SendOutcome::Timeout),
        }
    }

    /// Requests cancellation of the child turn and of every exec session the
    /// child started. The run is `stopped` as soon as this returns; teardown
    /// of in-flight work finishes in the background.
    ///
    /// A run that already finished keeps its status, but follow-up turns
    /// started through [`Self::send`] and their sessions are still cancelled.
    pub async fn stop(&self, run_id: &str) -> Result<StopOutcome, AgentError> {
        let _gate = self.status_gate.lock().await;
        let mut run = self.run(run_id).await?;
        if let Some(inputs) = self.inputs().remove(run_id) {
            inputs.cancel();
        }
        if run.status.is_terminal() {
            let killed = self.exec.kill_owned(&run.child_conversation_id);
            if killed > 0 {
                tracing::info!(run_id, killed_sessions = killed, "follow-up work of finished subagent stopped");
            }
            return Ok(StopOutcome::AlreadyTerminal {
                run_status: run.status,
            });
        }

        run.status = RunStatus::Stopped;
        run.ended_at = Some(Utc::now());
        self.store.update_run(run.clone()).await?;

        if let Some(cancel) = self.active().remove(run_id) {
            cancel.cancel();
        }
        let killed = self.exec.kill_owned(&run.child_conversation_id);
        tracing::info!(run_id, killed_sessions = killed, "subagent stopped");
        emit_quiet(
            self.emitter.as_ref(),
            RuntimeEvent::new(EventKind::SubagentStopped, Some(&run.parent_conversation_id))
                .with("run_id", run_id)
                .with("killed_sessions", killed as u64),
        );
        self.schedule_cleanup(run).await;
        Ok(StopOutcome::Stopped)
    }

    /// Startup reconciliation: runs that were in flight when the process
    /// went down become `interrupted`. They are never resumed.
    pub async fn recover(&self) -> Result<Vec<String>, AgentError> {
        let mut interrupted = Vec::new();
        for mut run in self.store.list_runs().await? {
            if !run.status.occupies_slot() {
                continue;
            }
            let previous = run.status;
            run.status = RunStatus::Interrupted;
            run.ended_at = Some(Utc::now());
            self.store.update_run(run.clone()).await?;
            tracing::info!(run_id = %run.id, previous = %previous, "subagent run marked interrupted");
            emit_quiet(
                self.emitter.as_ref(),
                RuntimeEvent::new(EventKind::SubagentInterrupted, Some(&run.parent_conversation_id))
                    .with("run_id", run.id.clone())
                    .with("previous_status", previous.label()),
            );
            interrupted.push(run.id);
        }
        Ok(interrupted)
    }

    pub fn shutdown(&self) {
        for (_, cancel) in self.active().drain() {
            cancel.cancel();
        }
        for (_, cancel) in self.inputs().drain() {
            cancel.cancel();
        }
        for (_, timer) in self.timers().drain() {
            timer.abort();
        }
    }

    async fn complete(&self, run: SubagentRun, result: Result<TurnOutcome, AgentError>) {
        let Some(run) = self.record_completion(run, result).await else {
            return;
        };
        if run.status != RunStatus::Stopped {
            self.announce(&run).await;
        }
        self.schedule_cleanup(run).await;
    }

    /// Writes the terminal status. `None` when `stop` got there first.
    async fn record_completion(
        &self,
        mut run: SubagentRun,
        result: Result<TurnOutcome, AgentError>,
    ) -> Option<SubagentRun> {
        let _gate = self.status_gate.lock().await;
        match self.store.get_run(&run.id).await {
            Ok(Some(current)) if current.status.is_terminal() => {
                tracing::debug!(run_id = %run.id, status = %current.status, "subagent finished after stop");
                return None;
            }
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(run_id = %run.id, %error, "could not read subagent run before completion");
            }
        }

        match result {
            Ok(outcome) if outcome.state == TurnState::Aborted => {
                run.status = RunStatus::Stopped;
            }
            Ok(outcome) if outcome.degraded && outcome.provider.is_none() => {
                run.status = RunStatus::Failed;
                run.error = Some(outcome.reply);
            }
            Ok(outcome) => {
                run.status = RunStatus::Completed;
                run.result = Some(outcome.reply);
            }
            Err(AgentError::Cancelled) => run.status = RunStatus::Stopped,
            Err(error) => {
                run.status = RunStatus::Failed;
                run.error = Some(error.to_string());
            }
        }
        run.ended_at = Some(Utc::now());

        if let Err(error) = self.store.update_run(run.clone()).await {
            tracing::error!(run_id = %run.id, %error, "could not persist subagent completion");
        }
        self.active().remove(&run.id);

        tracing::info!(run_id = %run.id, status = %run.status, "subagent finished");
        emit_quiet(
            self.emitter.as_ref(),
            RuntimeEvent::new(EventKind::SubagentCompleted, Some(&run.parent_conversation_id))
                .with("run_id", run.id.clone())
                .with("status", run.status.label()),
        );
        Some(run)
    }

    async fn announce(&self, run: &SubagentRun) {
        let name = run.label.as_deref().unwrap_or(&run.id);
        let text = match run.status {
            RunStatus::Completed => format!(
                "Subagent {name} completed.\n\n{}",
                run.result.as_deref().unwrap_or_default()
            ),
            _ => format!(
                "Subagent {name} {}: {}",
                run.status,
                run.error.as_deref().unwrap_or("no details")
            ),
        };

        let parent_id = &run.parent_conversation_id;
        {
            // A parent turn in flight writes its history when it ends.
            let _parent_turn = self.conversations.acquire_turn(parent_id).await.ok();
            if let Err(error) = self.conversations.append(parent_id, Message::system(text.clone())) {
                tracing::warn!(run_id = %run.id, %error, "could not append subagent announcement");
            }
        }
        let channel_target = self
            .conversations
            .get(parent_id)
            .and_then(|parent| parent.channel_target);
        if let Err(error) = self
            .channel
            .deliver(parent_id, channel_target.as_deref(), &text)
            .await
        {
            tracing::warn!(run_id = %run.id, %error, "subagent announcement delivery failed");
        }
        tracing::debug!(run_id = %run.id, "subagent announced");
    }

    async fn schedule_cleanup(&self, mut run: SubagentRun) {
        match run.cleanup_mode {
            CleanupMode::Discard => {
                self.conversations.remove(&run.child_conversation_id);
                run.archived = true;
                run.archive_at = Some(Utc::now());
                if let Err(error) = self.store.update_run(run.clone()).await {
                    tracing::warn!(run_id = %run.id, %error, "could not mark discarded run archived");
                }
                tracing::debug!(run_id = %run.id, "discarded subagent conversation");
            }
            CleanupMode::Keep if self.config.archive_after_secs == 0 => {}
            CleanupMode::Keep => {
                let delay = Duration::from_secs(self.config.archive_after_secs);
                run.archive_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|delay| Utc::now().checked_add_signed(delay));
                if let Err(error) = self.store.update_run(run.clone()).await {
                    tracing::warn!(run_id = %run.id, %error, "could not persist archive time");
                }

                let conversations = self.conversations.clone();
                let store = self.store.clone();
                let emitter = self.emitter.clone();
                let run_id = run.id.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    archive(&conversations, store.as_ref(), emitter.as_ref(), &run_id).await;
                });
                let mut timers = self.timers();
                timers.retain(|_, timer| !timer.is_finished());
                timers.insert(run.id, timer);
            }
        }
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn inputs(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.inputs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.archive_timers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn archive(
    conversations: &ConversationStore,
    store: &dyn RunStore,
    emitter: &dyn EventEmitter,
    run_id: &str,
) {
    let mut run = match store.get_run(run_id).await {
        Ok(Some(run)) => run,
        Ok(None) => return,
        Err(error) => {
            tracing::warn!(run_id, %error, "could not load run for archiving");
            return;
        }
    };
    conversations.remove(&run.child_conversation_id);
    run.archived = true;
    if let Err(error) = store.update_run(run.clone()).await {
        tracing::warn!(run_id, %error, "could not persist archived run");
        return;
    }
    tracing::info!(run_id, "subagent run archived");
    emit_quiet(
        emitter,
        RuntimeEvent::new(EventKind::SubagentArchived, Some(&run.parent_conversation_id))
            .with("run_id", run_id),
    );
}
