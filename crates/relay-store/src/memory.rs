use crate::store::{ProviderStateStore, RunStore, StoreError, StoreResult};
use crate::types::{ProviderState, RunId, SubagentRun};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub(crate) struct MemoryState {
    pub runs: BTreeMap<RunId, SubagentRun>,
    pub providers: BTreeMap<String, ProviderState>,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_state(state: MemoryState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub(crate) fn snapshot(&self) -> StoreResult<MemoryState> {
        Ok(self.lock()?.clone())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory store mutex poisoned".to_string()))
    }
}

#[async_trait::async_trait]
impl RunStore for MemoryStore {
    async fn create_run(&self, run: SubagentRun) -> StoreResult<()> {
        let mut state = self.lock()?;
        if state.runs.contains_key(&run.id) {
            return Err(StoreError::Conflict(format!("run '{}' already exists", run.id)));
        }
        state.runs.insert(run.id.clone(), run);
        Ok(())
    }

    async fn update_run(&self, run: SubagentRun) -> StoreResult<()> {
        let mut state = self.lock()?;
        let Some(existing) = state.runs.get_mut(&run.id) else {
            return Err(StoreError::NotFound {
                resource: "run",
                id: run.id,
            });
        };
        *existing = run;
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> StoreResult<Option<SubagentRun>> {
        Ok(self.lock()?.runs.get(run_id).cloned())
    }

    async fn list_runs(&self) -> StoreResult<Vec<SubagentRun>> {
        let mut runs: Vec<SubagentRun> = self.lock()?.runs.values().cloned().collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(runs)
    }
}

#[async_trait::async_trait]
impl ProviderStateStore for MemoryStore {
    async fn put_provider_state(&self, provider: ProviderState) -> StoreResult<()> {
        self.lock()?
            .providers
            .insert(provider.provider_id.clone(), provider);
        Ok(())
    }

    async fn get_provider_state(&self, provider_id: &str) -> StoreResult<Option<ProviderState>> {
        Ok(self.lock()?.providers.get(provider_id).cloned())
    }

    async fn list_provider_states(&self) -> StoreResult<Vec<ProviderState>> {
        Ok(self.lock()?.providers.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CleanupMode, RunStatus};

    fn run(id: &str) -> SubagentRun {
        SubagentRun::new(id, "parent", format!("child-{id}"), "task", CleanupMode::Keep)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn create_run_twice_is_conflict() {
        let store = MemoryStore::new();
        store.create_run(run("r1")).await.expect("first create");

        let error = store
            .create_run(run("r1"))
            .await
            .expect_err("duplicate create should fail");
        assert!(matches!(error, StoreError::Conflict(_)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn update_unknown_run_is_not_found() {
        let store = MemoryStore::new();
        let error = store
            .update_run(run("ghost"))
            .await
            .expect_err("update should fail");
        assert!(matches!(
            error,
            StoreError::NotFound {
                resource: "run",
                ..
            }
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn update_is_visible_to_next_read() {
        let store = MemoryStore::new();
        let mut record = run("r1");
        store.create_run(record.clone()).await.expect("create");

        record.status = RunStatus::Completed;
        record.result = Some("done".to_string());
        store.update_run(record.clone()).await.expect("update");

        let loaded = store
            .get_run("r1")
            .await
            .expect("get")
            .expect("run should exist");
        assert_eq!(loaded, record);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn provider_state_put_replaces_previous_value() {
        let store = MemoryStore::new();
        let mut state = ProviderState::new("alpha");
        store.put_provider_state(state.clone()).await.expect("put");
        state.auto_disabled = true;
        store.put_provider_state(state.clone()).await.expect("put");

        let states = store.list_provider_states().await.expect("list");
        assert_eq!(states, vec![state]);
    }
}
