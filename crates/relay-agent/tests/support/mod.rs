#![allow(dead_code)]

use async_trait::async_trait;
use relay_agent::{
    AgentConfig, AgentRuntime, BufferedChannel, BufferedEventEmitter, FeatureAllowlist,
    NewConversation,
};
use relay_llm::{
    Client, ContentPart, FinishReason, Message, ProviderAdapter, ProviderError, Request,
    Response, Role, ToolCallData, Usage,
};
use relay_store::MemoryStore;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type Scripted = Result<Response, ProviderError>;

/// Replays queued responses in order. Once the queue is empty it answers
/// with `fallback`, or a plain "ok" text when none is set.
#[derive(Clone)]
pub struct SequenceAdapter {
    pub name: String,
    pub responses: Arc<Mutex<VecDeque<Scripted>>>,
    pub requests: Arc<Mutex<Vec<Request>>>,
    pub fallback: Arc<Mutex<Option<Response>>>,
    pub delay: Duration,
}

impl SequenceAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            responses: Arc::new(Mutex::new(VecDeque::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
            fallback: Arc::new(Mutex::new(None)),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn enqueue(&self, response: Scripted) {
        self.responses
            .lock()
            .expect("responses mutex")
            .push_back(response);
    }

    pub fn always(&self, response: Response) {
        *self.fallback.lock().expect("fallback mutex") = Some(response);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().expect("requests mutex").len()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().expect("requests mutex").clone()
    }
}

#[async_trait]
impl ProviderAdapter for SequenceAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: Request) -> Result<Response, ProviderError> {
        self.requests.lock().expect("requests mutex").push(request);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let queued = self.responses.lock().expect("responses mutex").pop_front();
        match queued {
            Some(scripted) => scripted,
            None => Ok(self
                .fallback
                .lock()
                .expect("fallback mutex")
                .clone()
                .unwrap_or_else(|| text_response(&self.name, "ok"))),
        }
    }
}

pub fn text_response(provider: &str, text: &str) -> Response {
    Response {
        id: format!("resp-{provider}"),
        provider: provider.to_string(),
        model: "test-model".to_string(),
        message: Message::assistant(text),
        finish_reason: FinishReason::Stop,
        usage: Usage {
            input_tokens: 1,
            output_tokens: 1,
        },
    }
}

pub fn tool_call_response(provider: &str, calls: Vec<(&str, &str, serde_json::Value)>) -> Response {
    let content = calls
        .into_iter()
        .map(|(id, name, arguments)| {
            ContentPart::tool_call(ToolCallData {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
                raw_arguments: None,
            })
        })
        .collect();
    Response {
        id: format!("resp-{provider}"),
        provider: provider.to_string(),
        model: "test-model".to_string(),
        message: Message {
            role: Role::Assistant,
            content,
            tool_call_id: None,
        },
        finish_reason: FinishReason::ToolCalls,
        usage: Usage {
            input_tokens: 1,
            output_tokens: 1,
        },
    }
}

pub fn client_with(adapters: &[SequenceAdapter]) -> Client {
    let mut client = Client::default();
    for adapter in adapters {
        client.register_provider(Arc::new(adapter.clone()));
    }
    client
}

/// Config tuned for tests: fast retries, the given chain, `echo`, `cat` and
/// `sleep` allowed, and a temp workspace.
pub fn test_config(chain: &[&str], workspace: &std::path::Path) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.providers.chain = chain.iter().map(|id| id.to_string()).collect();
    config.turn.retry_backoff.initial_delay_ms = 1;
    config.turn.retry_backoff.max_delay_ms = 5;
    config.turn.retry_backoff.jitter = false;
    config.exec.static_allowlist = vec!["echo".into(), "cat".into(), "sleep".into()];
    config.exec.workspace_root = workspace.to_path_buf();
    config
}

pub struct Harness {
    pub runtime: AgentRuntime,
    pub channel: BufferedChannel,
    pub events: BufferedEventEmitter,
    pub store: MemoryStore,
    pub workspace: tempfile::TempDir,
}

impl Harness {
    pub fn conversation(&self) -> String {
        self.runtime
            .create_conversation(NewConversation {
                channel_target: Some("chat:test".to_string()),
                ..NewConversation::default()
            })
            .id
    }
}

pub fn harness(adapters: &[SequenceAdapter], configure: impl FnOnce(&mut AgentConfig)) -> Harness {
    harness_with_store(adapters, MemoryStore::new(), configure)
}

pub fn harness_with_store(
    adapters: &[SequenceAdapter],
    store: MemoryStore,
    configure: impl FnOnce(&mut AgentConfig),
) -> Harness {
    let workspace = tempfile::tempdir().expect("workspace dir");
    let chain: Vec<&str> = adapters.iter().map(|adapter| adapter.name.as_str()).collect();
    let mut config = test_config(&chain, workspace.path());
    configure(&mut config);

    let channel = BufferedChannel::default();
    let events = BufferedEventEmitter::default();
    let allowlist = Arc::new(FeatureAllowlist::from_config(&config.exec));
    let runtime = AgentRuntime::new(
        config,
        client_with(adapters),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(channel.clone()),
        allowlist,
        Arc::new(events.clone()),
    )
    .expect("runtime should build");

    Harness {
        runtime,
        channel,
        events,
        store,
        workspace,
    }
}

/// Polls `check` every 20ms until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
