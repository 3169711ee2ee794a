//! Orchestration core of the relay agent runtime.
//!
//! A turn executor drives the provider/tool loop for each inbound message,
//! an exec session manager runs allow-listed commands in the foreground or
//! background, a subagent orchestrator runs isolated child conversations
//! under a concurrency cap, and a provider runtime tracks which backends
//! may serve turns. [`AgentRuntime`] wires them together.

pub mod allowlist;
pub mod channel;
pub mod config;
pub mod conversation;
pub mod errors;
pub mod events;
pub mod exec;
pub mod executor;
pub mod fallback;
pub mod providers;
pub mod reminders;
pub mod retry;
pub mod runtime;
pub mod subagents;
pub mod tools;
pub mod truncation;
pub mod turn;

pub use allowlist::{
    AllowlistProvider, BinaryResolver, CommandGate, FeatureAllowlist, compute_allowlist,
};
pub use channel::{BufferedChannel, ChannelDelivery, Delivery, NoopChannel};
pub use config::*;
pub use conversation::{Conversation, ConversationStore, NewConversation, child_queue_key};
pub use errors::*;
pub use events::*;
pub use exec::{
    ExecOutcome, ExecRequest, ExecSessionManager, KillOutcome, LogView, PollResult,
    ProcessAction, ProcessResponse, SessionState, SessionSummary, TerminalEvent,
};
pub use executor::{NO_PROVIDER_REPLY, TurnExecutor};
pub use providers::ProviderRuntime;
pub use reminders::{ReminderScheduler, ScheduledReminder};
pub use retry::{RetryBackoffConfig, delay_for_attempt_ms};
pub use runtime::{AgentRuntime, StartupReport};
pub use subagents::{
    RunSummary, SendOutcome, SpawnOutcome, SpawnRequest, StopOutcome, SubagentOrchestrator,
};
pub use tools::{ToolContext, ToolRegistry, ToolServices, build_default_registry};
pub use truncation::*;
pub use turn::*;
