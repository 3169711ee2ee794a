//! Conversation turn executor.
//!
//! One call to [`TurnExecutor::run_turn`] drives the provider/tool loop for
//! a single inbound message:
//!
//! `AWAITING_PROVIDER_RESPONSE -> (DISPATCHING_TOOLS -> AWAITING_PROVIDER_RESPONSE)* -> FINALIZED`
//!
//! The loop is bounded by `turn.max_tool_rounds`. Provider failures are
//! retried with backoff on the same provider, then failed over along the
//! configured chain. Turns of one conversation are serialized through the
//! conversation's queue key.

use crate::config::AgentConfig;
use crate::conversation::{Conversation, ConversationStore};
use crate::events::{EventEmitter, EventKind, RuntimeEvent, emit_quiet};
use crate::fallback;
use crate::providers::ProviderRuntime;
use crate::retry::delay_for_attempt_ms;
use crate::tools::{EXEC_TOOL, ToolContext, ToolRegistry, ToolServices};
use crate::turn::{IssuedToolCall, Turn, TurnOutcome, TurnState};
use crate::AgentError;
use relay_llm::{
    Client, ContentPart, Message, ProviderError, Request, Response, Role, ToolCallData,
    ToolDefinition,
};
use serde_json::json;
use std::collections::HashSet;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const NO_PROVIDER_REPLY: &str = "No AI provider is currently available.";

pub struct TurnExecutor {
    config: Arc<AgentConfig>,
    client: Arc<Client>,
    providers: Arc<ProviderRuntime>,
    conversations: Arc<ConversationStore>,
    registry: ToolRegistry,
    services: Arc<ToolServices>,
    emitter: Arc<dyn EventEmitter>,
}

/// What one provider round produced, after failover.
enum ProviderReply {
    Answered { provider: String, response: Response },
    Exhausted,
}

impl TurnExecutor {
    pub fn new(
        client: Arc<Client>,
        providers: Arc<ProviderRuntime>,
        registry: ToolRegistry,
        services: Arc<ToolServices>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self {
            config: services.config.clone(),
            conversations: services.conversations.clone(),
            client,
            providers,
            registry,
            services,
            emitter,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn conversations(&self) -> &Arc<ConversationStore> {
        &self.conversations
    }

    pub async fn run_turn(
        &self,
        conversation_id: &str,
        user_message: &str,
    ) -> Result<TurnOutcome, AgentError> {
        self.run_turn_with_cancel(conversation_id, user_message, CancellationToken::new())
            .await
    }

    /// Runs one turn. Cancelling `cancel` aborts the turn at the next
    /// suspension point; the outcome then carries `TurnState::Aborted`.
    pub async fn run_turn_with_cancel(
        &self,
        conversation_id: &str,
        user_message: &str,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let _queue = tokio::select! {
            guard = self.conversations.acquire_turn(conversation_id) => guard?,
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
        };
        let conversation = self
            .conversations
            .get(conversation_id)
            .ok_or_else(|| AgentError::ConversationNotFound(conversation_id.to_string()))?;

        let history_len = conversation.messages.len();
        let mut turn = Turn::new(conversation_id, conversation.messages.clone());
        turn.messages.push(Message::user(user_message));

        tracing::info!(conversation_id, turn_id = %turn.id, "turn started");
        emit_quiet(
            self.emitter.as_ref(),
            RuntimeEvent::new(EventKind::TurnStart, Some(conversation_id))
                .with("turn_id", turn.id.clone()),
        );

        let outcome = self
            .drive(&mut turn, &conversation, user_message, &cancel)
            .await?;

        // Aborted turns persist only the user message.
        let new_messages = match outcome.state {
            TurnState::Aborted => vec![Message::user(user_message)],
            _ => turn.messages.split_off(history_len),
        };
        if let Err(error) = self.conversations.extend(conversation_id, new_messages) {
            tracing::warn!(conversation_id, turn_id = %turn.id, %error, "could not persist turn messages");
        }

        tracing::info!(
            conversation_id,
            turn_id = %turn.id,
            state = %outcome.state,
            iterations = outcome.iterations,
            degraded = outcome.degraded,
            "turn finished"
        );
        emit_quiet(
            self.emitter.as_ref(),
            RuntimeEvent::new(EventKind::TurnEnd, Some(conversation_id))
                .with("turn_id", turn.id.clone())
                .with("state", outcome.state.as_str())
                .with("iterations", outcome.iterations as u64)
                .with("degraded", outcome.degraded),
        );
        Ok(outcome)
    }

    async fn drive(
        &self,
        turn: &mut Turn,
        conversation: &Conversation,
        user_message: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let tools = self.registry.definitions();
        let max_rounds = self.config.turn.max_tool_rounds;
        let mut provider_used: Option<String> = None;
        let mut tool_call_count = 0;
        let mut tool_error_count = 0;

        let finish = |turn: &Turn,
                      reply: String,
                      degraded: bool,
                      provider: Option<String>,
                      calls: usize,
                      errors: usize| TurnOutcome {
            turn_id: turn.id.clone(),
            reply,
            state: turn.state(),
            iterations: turn.iteration,
            tool_call_count: calls,
            tool_error_count: errors,
            degraded,
            provider,
            usage: turn.usage,
        };

        loop {
            let reply = match self.call_provider(turn, conversation, &tools, cancel).await {
                Ok(reply) => reply,
                Err(AgentError::Cancelled) => {
                    turn.transition_to(TurnState::Aborted)?;
                    return Ok(finish(turn, String::new(), true, provider_used, tool_call_count, tool_error_count));
                }
                Err(error) => return Err(error),
            };

            let (provider, response) = match reply {
                ProviderReply::Answered { provider, response } => (provider, response),
                ProviderReply::Exhausted => {
                    tracing::error!(conversation_id = %turn.conversation_id, turn_id = %turn.id, "provider chain exhausted");
                    emit_quiet(
                        self.emitter.as_ref(),
                        RuntimeEvent::new(EventKind::Error, Some(&turn.conversation_id))
                            .with("turn_id", turn.id.clone())
                            .with("error", AgentError::NoProviderAvailable.to_string()),
                    );
                    turn.messages.push(Message::assistant(NO_PROVIDER_REPLY));
                    turn.transition_to(TurnState::Finalized)?;
                    return Ok(finish(turn, NO_PROVIDER_REPLY.to_string(), true, None, tool_call_count, tool_error_count));
                }
            };
            provider_used = Some(provider);
            turn.usage = turn.usage + response.usage;

            let mut assistant = response.message;
            let mut tool_calls = assistant.tool_calls();
            let text = assistant.text();

            if turn.iteration == 0
                && fallback::is_exec_intent(user_message)
                && fallback::is_malformed_response(&text, &tool_calls)
            {
                if let Some(command) = fallback::extract_command(&text, &tool_calls, user_message) {
                    tracing::warn!(
                        conversation_id = %turn.conversation_id,
                        turn_id = %turn.id,
                        %command,
                        "provider skipped structured tool call, recovering exec command"
                    );
                    emit_quiet(
                        self.emitter.as_ref(),
                        RuntimeEvent::new(EventKind::ExecFallback, Some(&turn.conversation_id))
                            .with("turn_id", turn.id.clone())
                            .with("command", command.clone()),
                    );
                    let call = ToolCallData {
                        id: format!("fallback-{}", Uuid::new_v4().simple()),
                        name: EXEC_TOOL.to_string(),
                        arguments: json!({ "command": command }),
                        raw_arguments: None,
                    };
                    assistant = Message {
                        role: Role::Assistant,
                        content: vec![ContentPart::tool_call(call.clone())],
                        tool_call_id: None,
                    };
                    tool_calls = vec![call];
                }
            }

            if tool_calls.is_empty() {
                turn.messages.push(assistant);
                turn.transition_to(TurnState::Finalized)?;
                return Ok(finish(turn, text, false, provider_used, tool_call_count, tool_error_count));
            }

            if turn.iteration >= max_rounds {
                let reply = limit_reply(max_rounds, &text);
                tracing::warn!(
                    conversation_id = %turn.conversation_id,
                    turn_id = %turn.id,
                    max_rounds,
                    "tool round limit reached"
                );
                emit_quiet(
                    self.emitter.as_ref(),
                    RuntimeEvent::new(EventKind::TurnLimit, Some(&turn.conversation_id))
                        .with("turn_id", turn.id.clone())
                        .with("max_tool_rounds", max_rounds as u64),
                );
                turn.messages.push(Message::assistant(reply.clone()));
                turn.transition_to(TurnState::Finalized)?;
                return Ok(finish(turn, reply, true, provider_used, tool_call_count, tool_error_count));
            }

            turn.transition_to(TurnState::DispatchingTools)?;
            turn.messages.push(assistant);
            let issued: Vec<IssuedToolCall> = tool_calls
                .iter()
                .map(|call| IssuedToolCall::from_provider(call, &turn.id))
                .collect();
            let context = ToolContext {
                conversation_id: turn.conversation_id.clone(),
                turn_id: turn.id.clone(),
                call_id: String::new(),
                services: self.services.clone(),
            };

            let results = tokio::select! {
                results = self.registry.dispatch(
                    issued,
                    &context,
                    &self.config.turn.tool_output_limits,
                    self.emitter.as_ref(),
                    self.config.turn.parallel_tool_calls,
                ) => results,
                _ = cancel.cancelled() => {
                    turn.transition_to(TurnState::Aborted)?;
                    return Ok(finish(turn, String::new(), true, provider_used, tool_call_count, tool_error_count));
                }
            };
            tool_call_count += results.len();
            tool_error_count += results.iter().filter(|result| result.is_error()).count();
            turn.append_results(results);
            turn.iteration += 1;
            turn.transition_to(TurnState::AwaitingProviderResponse)?;
        }
    }

    /// Walks the chain until some provider answers. Retryable failures are
    /// retried on the same provider first; providers given up on are only
    /// skipped for this call.
    async fn call_provider(
        &self,
        turn: &Turn,
        conversation: &Conversation,
        tools: &[ToolDefinition],
        cancel: &CancellationToken,
    ) -> Result<ProviderReply, AgentError> {
        let mut excluded = HashSet::new();
        let retry = &self.config.turn;
        let seed = jitter_seed(&turn.id, turn.iteration);

        loop {
            let Some(provider) = self.providers.select_provider_excluding(&excluded) else {
                return Ok(ProviderReply::Exhausted);
            };
            tracing::debug!(conversation_id = %turn.conversation_id, turn_id = %turn.id, %provider, "provider selected");
            emit_quiet(
                self.emitter.as_ref(),
                RuntimeEvent::new(EventKind::ProviderSelected, Some(&turn.conversation_id))
                    .with("turn_id", turn.id.clone())
                    .with("provider", provider.clone()),
            );

            let request = self.build_request(&provider, turn, conversation, tools);
            let mut attempt: u32 = 0;
            let last_error: ProviderError = loop {
                let result = tokio::select! {
                    result = self.client.complete(request.clone()) => result,
                    _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                };
                let error = match result {
                    Ok(response) => return Ok(ProviderReply::Answered { provider, response }),
                    Err(error) => error,
                };

                let outcome = error.outcome();
                if outcome.disables_provider() {
                    let detail = error.to_string();
                    self.providers
                        .report_outcome(&provider, outcome, Some(&detail))
                        .await?;
                    break error;
                }
                if !outcome.is_retryable() || attempt >= retry.max_provider_retries {
                    break error;
                }

                attempt += 1;
                let delay_ms =
                    delay_for_attempt_ms(attempt, &retry.retry_backoff, seed, error.retry_after_ms());
                tracing::warn!(
                    conversation_id = %turn.conversation_id,
                    turn_id = %turn.id,
                    %provider,
                    attempt,
                    delay_ms,
                    %error,
                    "provider call failed, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                    _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                }
            };

            tracing::warn!(
                conversation_id = %turn.conversation_id,
                turn_id = %turn.id,
                %provider,
                outcome = %last_error.outcome(),
                error = %last_error,
                "failing over to next provider"
            );
            emit_quiet(
                self.emitter.as_ref(),
                RuntimeEvent::new(EventKind::ProviderFailover, Some(&turn.conversation_id))
                    .with("turn_id", turn.id.clone())
                    .with("provider", provider.clone())
                    .with("outcome", last_error.outcome().as_str())
                    .with("error", last_error.to_string()),
            );
            excluded.insert(provider);
        }
    }

    fn build_request(
        &self,
        provider: &str,
        turn: &Turn,
        conversation: &Conversation,
        tools: &[ToolDefinition],
    ) -> Request {
        let mut messages = Vec::with_capacity(turn.messages.len() + 1);
        if let Some(prompt) = &self.config.turn.system_prompt {
            messages.push(Message::system(prompt.clone()));
        }
        messages.extend(turn.messages.iter().cloned());

        let model = conversation.model_override.clone().or_else(|| {
            let configured = self.config.turn.model.trim();
            (!configured.is_empty()).then(|| configured.to_string())
        });
        Request {
            provider: Some(provider.to_string()),
            model,
            messages,
            tools: tools.to_vec(),
            reasoning_effort: conversation.thinking_override.clone(),
            metadata: None,
        }
    }
}

fn limit_reply(max_rounds: usize, last_text: &str) -> String {
    let mut reply = format!(
        "I stopped after {max_rounds} rounds of tool calls without reaching a final answer."
    );
    let last_text = last_text.trim();
    if !last_text.is_empty() {
        reply.push_str("\n\n");
        reply.push_str(last_text);
    }
    reply
}

fn jitter_seed(turn_id: &str, iteration: usize) -> u64 {
    let mut hasher = DefaultHasher::new();
    turn_id.hash(&mut hasher);
    iteration.hash(&mut hasher);
    hasher.finish()
}
