use crate::types::{ProviderState, SubagentRun};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("resource not found: {resource} ({id})")]
    NotFound { resource: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("backend failure: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable record of subagent runs. Implementations must give
/// read-after-write consistency: a run returned by `create_run` or
/// `update_run` is visible to the next `get_run`/`list_runs`.
#[async_trait::async_trait]
pub trait RunStore: Send + Sync {
    /// Fails with `Conflict` when a run with the same id already exists.
    async fn create_run(&self, run: SubagentRun) -> StoreResult<()>;

    /// Fails with `NotFound` when the run was never created.
    async fn update_run(&self, run: SubagentRun) -> StoreResult<()>;

    async fn get_run(&self, run_id: &str) -> StoreResult<Option<SubagentRun>>;

    /// Runs ordered by creation time, oldest first.
    async fn list_runs(&self) -> StoreResult<Vec<SubagentRun>>;
}

#[async_trait::async_trait]
pub trait ProviderStateStore: Send + Sync {
    async fn put_provider_state(&self, state: ProviderState) -> StoreResult<()>;

    async fn get_provider_state(&self, provider_id: &str) -> StoreResult<Option<ProviderState>>;

    async fn list_provider_states(&self) -> StoreResult<Vec<ProviderState>>;
}
