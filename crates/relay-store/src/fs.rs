use crate::memory::{MemoryState, MemoryStore};
use crate::store::{ProviderStateStore, RunStore, StoreError, StoreResult};
use crate::types::{ProviderState, SubagentRun};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const STATE_FILE_NAME: &str = "relay-state.json";

/// File-backed store. Every mutation rewrites the whole state file through a
/// temp file and rename, so a crash never leaves a half-written record.
#[derive(Clone, Debug)]
pub struct FsStore {
    state_file: PathBuf,
    inner: MemoryStore,
    write_lock: Arc<Mutex<()>>,
}

impl FsStore {
    pub fn new<P: AsRef<Path>>(root: P) -> StoreResult<Self> {
        fs::create_dir_all(root.as_ref())
            .map_err(|err| StoreError::Backend(format!("create fs store root failed: {err}")))?;
        let state_file = root.as_ref().join(STATE_FILE_NAME);
        let state = if state_file.exists() {
            let raw = fs::read(&state_file)
                .map_err(|err| StoreError::Backend(format!("read state file failed: {err}")))?;
            serde_json::from_slice::<MemoryState>(&raw)
                .map_err(|err| StoreError::Serialization(err.to_string()))?
        } else {
            MemoryState::default()
        };

        Ok(Self {
            state_file,
            inner: MemoryStore::from_state(state),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    fn persist(&self) -> StoreResult<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::Backend("fs store write lock poisoned".to_string()))?;
        let snapshot = self.inner.snapshot()?;
        let raw = serde_json::to_vec_pretty(&snapshot)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        let tmp = self.state_file.with_extension("json.tmp");
        fs::write(&tmp, raw)
            .map_err(|err| StoreError::Backend(format!("write state file failed: {err}")))?;
        fs::rename(&tmp, &self.state_file)
            .map_err(|err| StoreError::Backend(format!("rename state file failed: {err}")))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl RunStore for FsStore {
    async fn create_run(&self, run: SubagentRun) -> StoreResult<()> {
        self.inner.create_run(run).await?;
        self.persist()
    }

    async fn update_run(&self, run: SubagentRun) -> StoreResult<()> {
        self.inner.update_run(run).await?;
        self.persist()
    }

    async fn get_run(&self, run_id: &str) -> StoreResult<Option<SubagentRun>> {
        self.inner.get_run(run_id).await
    }

    async fn list_runs(&self) -> StoreResult<Vec<SubagentRun>> {
        self.inner.list_runs().await
    }
}

#[async_trait::async_trait]
impl ProviderStateStore for FsStore {
    async fn put_provider_state(&self, state: ProviderState) -> StoreResult<()> {
        self.inner.put_provider_state(state).await?;
        self.persist()
    }

    async fn get_provider_state(&self, provider_id: &str) -> StoreResult<Option<ProviderState>> {
        self.inner.get_provider_state(provider_id).await
    }

    async fn list_provider_states(&self) -> StoreResult<Vec<ProviderState>> {
        self.inner.list_provider_states().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CleanupMode, RunStatus};

    #[tokio::test(flavor = "current_thread")]
    async fn fs_store_reopen_restores_runs_and_provider_state() {
        let tmp = tempfile::tempdir().expect("tempdir should be created");
        let store = FsStore::new(tmp.path()).expect("fs store should initialize");

        let mut run = SubagentRun::new("run-1", "parent", "child", "index docs", CleanupMode::Keep);
        run.status = RunStatus::Running;
        store.create_run(run.clone()).await.expect("create run");

        let mut provider = ProviderState::new("alpha");
        provider.auto_disabled = true;
        provider.disabled_reason = Some("billing".to_string());
        store
            .put_provider_state(provider.clone())
            .await
            .expect("put provider");
        drop(store);

        let reopened = FsStore::new(tmp.path()).expect("fs store should reopen");
        let loaded = reopened
            .get_run("run-1")
            .await
            .expect("get run")
            .expect("run should survive reopen");
        assert_eq!(loaded, run);
        let loaded_provider = reopened
            .get_provider_state("alpha")
            .await
            .expect("get provider")
            .expect("provider should survive reopen");
        assert_eq!(loaded_provider, provider);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fs_store_leaves_no_temp_file_behind() {
        let tmp = tempfile::tempdir().expect("tempdir should be created");
        let store = FsStore::new(tmp.path()).expect("fs store should initialize");
        store
            .put_provider_state(ProviderState::new("alpha"))
            .await
            .expect("put provider");

        assert!(store.state_file().exists());
        assert!(!store.state_file().with_extension("json.tmp").exists());
    }

    #[test]
    fn fs_store_rejects_corrupt_state_file() {
        let tmp = tempfile::tempdir().expect("tempdir should be created");
        fs::write(tmp.path().join(STATE_FILE_NAME), b"{not json").expect("write corrupt file");

        let error = FsStore::new(tmp.path()).expect_err("corrupt state should fail");
        assert!(matches!(error, StoreError::Serialization(_)));
    }
}
