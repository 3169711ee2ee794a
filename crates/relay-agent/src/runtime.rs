//! Wiring for a complete agent runtime.

use crate::allowlist::{AllowlistProvider, BinaryResolver, CommandGate};
use crate::channel::ChannelDelivery;
use crate::config::AgentConfig;
use crate::conversation::{Conversation, ConversationStore, NewConversation};
use crate::events::EventEmitter;
use crate::exec::ExecSessionManager;
use crate::executor::TurnExecutor;
use crate::providers::ProviderRuntime;
use crate::reminders::ReminderScheduler;
use crate::subagents::SubagentOrchestrator;
use crate::tools::{ToolServices, build_default_registry};
use crate::turn::TurnOutcome;
use crate::AgentError;
use relay_llm::Client;
use relay_store::{ProviderStateStore, RunStore};
use serde::Serialize;
use std::sync::Arc;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StartupReport {
    pub interrupted_runs: Vec<String>,
}

pub struct AgentRuntime {
    config: Arc<AgentConfig>,
    conversations: Arc<ConversationStore>,
    providers: Arc<ProviderRuntime>,
    exec: ExecSessionManager,
    reminders: Arc<ReminderScheduler>,
    executor: Arc<TurnExecutor>,
    subagents: Arc<SubagentOrchestrator>,
}

impl AgentRuntime {
    pub fn new(
        config: AgentConfig,
        client: Client,
        run_store: Arc<dyn RunStore>,
        provider_store: Arc<dyn ProviderStateStore>,
        channel: Arc<dyn ChannelDelivery>,
        allowlist: Arc<dyn AllowlistProvider>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Result<Self, AgentError> {
        config.validate()?;
        let config = Arc::new(config);

        let gate = CommandGate::new(allowlist, BinaryResolver::from_config(&config.exec));
        let exec = ExecSessionManager::new(config.exec.clone(), gate, emitter.clone());
        let conversations = Arc::new(ConversationStore::new());
        let reminders = Arc::new(ReminderScheduler::new(
            conversations.clone(),
            channel.clone(),
            emitter.clone(),
        ));
        let providers = Arc::new(ProviderRuntime::new(
            config.providers.chain.clone(),
            provider_store,
            emitter.clone(),
        ));

        let services = Arc::new(ToolServices::new(
            config.clone(),
            exec.clone(),
            conversations.clone(),
            reminders.clone(),
        ));
        let executor = Arc::new(TurnExecutor::new(
            Arc::new(client),
            providers.clone(),
            build_default_registry(),
            services.clone(),
            emitter.clone(),
        ));
        let subagents = Arc::new(SubagentOrchestrator::new(
            config.subagents.clone(),
            executor.clone(),
            exec.clone(),
            run_store,
            channel,
            emitter,
        ));
        services.attach_subagents(&subagents);

        Ok(Self {
            config,
            conversations,
            providers,
            exec,
            reminders,
            executor,
            subagents,
        })
    }

    /// Reconciles persisted runs and loads provider state. Call once before
    /// serving turns.
    pub async fn startup(&self) -> Result<StartupReport, AgentError> {
        let interrupted_runs = self.subagents.recover().await?;
        self.providers.load().await?;
        tracing::info!(
            interrupted = interrupted_runs.len(),
            providers = self.providers.chain().len(),
            "agent runtime started"
        );
        Ok(StartupReport { interrupted_runs })
    }

    pub fn create_conversation(&self, request: NewConversation) -> Conversation {
        self.conversations.create(request)
    }

    pub async fn run_turn(
        &self,
        conversation_id: &str,
        user_message: &str,
    ) -> Result<TurnOutcome, AgentError> {
        self.executor.run_turn(conversation_id, user_message).await
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn conversations(&self) -> &Arc<ConversationStore> {
        &self.conversations
    }

    pub fn providers(&self) -> &Arc<ProviderRuntime> {
        &self.providers
    }

    pub fn exec(&self) -> &ExecSessionManager {
        &self.exec
    }

    pub fn reminders(&self) -> &Arc<ReminderScheduler> {
        &self.reminders
    }

    pub fn executor(&self) -> &Arc<TurnExecutor> {
        &self.executor
    }

    pub fn subagents(&self) -> &Arc<SubagentOrchestrator> {
        &self.subagents
    }

    /// Cancels subagents and reminders, then kills every exec session.
    pub async fn shutdown(&self) {
        self.subagents.shutdown();
        self.reminders.shutdown();
        self.exec.shutdown().await;
        tracing::info!("agent runtime shut down");
    }
}
