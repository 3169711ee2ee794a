//! Provider eligibility state shared by every concurrently running turn.
//!
//! Reads go through an `RwLock` snapshot. All writes funnel through one
//! async write gate, so the `{enabled, auto_disabled}` pair is only ever
//! changed by a single writer and is persisted before the gate is released.

use crate::AgentError;
use crate::events::{EventEmitter, EventKind, RuntimeEvent, emit_quiet};
use chrono::Utc;
use relay_llm::ProviderOutcome;
use relay_store::{ProviderState, ProviderStateStore};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard};
use tokio::sync::Mutex;

pub struct ProviderRuntime {
    chain: Vec<String>,
    states: RwLock<HashMap<String, ProviderState>>,
    write_gate: Mutex<()>,
    store: Arc<dyn ProviderStateStore>,
    emitter: Arc<dyn EventEmitter>,
}

impl ProviderRuntime {
    pub fn new(
        chain: Vec<String>,
        store: Arc<dyn ProviderStateStore>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        let states = chain
            .iter()
            .map(|id| (id.clone(), ProviderState::new(id.clone())))
            .collect();
        Self {
            chain,
            states: RwLock::new(states),
            write_gate: Mutex::new(()),
            store,
            emitter,
        }
    }

    /// Replaces in-memory state with whatever was persisted for chain members.
    pub async fn load(&self) -> Result<(), AgentError> {
        let _gate = self.write_gate.lock().await;
        let persisted = self.store.list_provider_states().await?;
        let mut states = self
            .states
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for state in persisted {
            if states.contains_key(&state.provider_id) {
                states.insert(state.provider_id.clone(), state);
            }
        }
        Ok(())
    }

    pub fn chain(&self) -> &[String] {
        &self.chain
    }

    pub fn select_provider(&self) -> Option<String> {
        self.select_provider_excluding(&HashSet::new())
    }

    /// First eligible provider in chain order that the caller has not
    /// already given up on for the current call.
    pub fn select_provider_excluding(&self, excluded: &HashSet<String>) -> Option<String> {
        let states = self.read();
        self.chain
            .iter()
            .filter(|id| !excluded.contains(*id))
            .find(|id| states.get(*id).is_some_and(ProviderState::is_eligible))
            .cloned()
    }

    pub fn state(&self, provider_id: &str) -> Option<ProviderState> {
        self.read().get(provider_id).cloned()
    }

    /// States in chain order.
    pub fn snapshot(&self) -> Vec<ProviderState> {
        let states = self.read();
        self.chain
            .iter()
            .filter_map(|id| states.get(id).cloned())
            .collect()
    }

    /// Returns true when the report auto-disabled the provider.
    pub async fn report_outcome(
        &self,
        provider_id: &str,
        outcome: ProviderOutcome,
        detail: Option<&str>,
    ) -> Result<bool, AgentError> {
        if !outcome.disables_provider() {
            return Ok(false);
        }

        let reason = match detail {
            Some(detail) => format!("{outcome}: {detail}"),
            None => outcome.to_string(),
        };
        let changed = self
            .write(provider_id, |state| {
                if state.auto_disabled {
                    return false;
                }
                state.auto_disabled = true;
                state.disabled_reason = Some(reason.clone());
                true
            })
            .await?;

        if changed {
            tracing::warn!(provider = %provider_id, %reason, "provider auto-disabled");
            emit_quiet(
                self.emitter.as_ref(),
                RuntimeEvent::new(EventKind::ProviderAutoDisabled, None)
                    .with("provider", provider_id)
                    .with("reason", reason),
            );
        }
        Ok(changed)
    }

    pub async fn clear_auto_disable(&self, provider_id: &str) -> Result<ProviderState, AgentError> {
        self.write(provider_id, |state| {
            let changed = state.auto_disabled;
            state.auto_disabled = false;
            if state.enabled {
                state.disabled_reason = None;
            }
            changed
        })
        .await?;
        tracing::info!(provider = %provider_id, "provider auto-disable cleared");
        self.state(provider_id)
            .ok_or_else(|| AgentError::UnknownProvider(provider_id.to_string()))
    }

    pub async fn set_enabled(
        &self,
        provider_id: &str,
        enabled: bool,
    ) -> Result<ProviderState, AgentError> {
        self.write(provider_id, |state| {
            let changed = state.enabled != enabled;
            state.enabled = enabled;
            if !enabled {
                state.disabled_reason = Some("disabled manually".to_string());
            } else if !state.auto_disabled {
                state.disabled_reason = None;
            }
            changed
        })
        .await?;
        tracing::info!(provider = %provider_id, enabled, "provider manual switch changed");
        self.state(provider_id)
            .ok_or_else(|| AgentError::UnknownProvider(provider_id.to_string()))
    }

    async fn write<F>(&self, provider_id: &str, mutate: F) -> Result<bool, AgentError>
    where
        F: FnOnce(&mut ProviderState) -> bool,
    {
        let _gate = self.write_gate.lock().await;
        let mut next = self
            .state(provider_id)
            .ok_or_else(|| AgentError::UnknownProvider(provider_id.to_string()))?;
        if !mutate(&mut next) {
            return Ok(false);
        }
        next.updated_at = Utc::now();

        self.states
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(provider_id.to_string(), next.clone());
        self.store.put_provider_state(next).await?;
        Ok(true)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ProviderState>> {
        self.states
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventEmitter;
    use relay_store::MemoryStore;

    fn runtime(chain: &[&str], store: MemoryStore) -> ProviderRuntime {
        ProviderRuntime::new(
            chain.iter().map(|id| id.to_string()).collect(),
            Arc::new(store),
            Arc::new(NoopEventEmitter),
        )
    }

    #[tokio::test(flavor = "current_thread")]
    async fn billing_failure_moves_selection_to_next_provider() {
        let providers = runtime(&["a", "b", "c"], MemoryStore::new());
        assert_eq!(providers.select_provider().as_deref(), Some("a"));

        let disabled = providers
            .report_outcome("a", ProviderOutcome::BillingError, Some("card declined"))
            .await
            .expect("report should succeed");
        assert!(disabled);
        assert_eq!(providers.select_provider().as_deref(), Some("b"));

        let state = providers.state("a").expect("state should exist");
        assert!(state.auto_disabled);
        assert!(state.enabled);
        assert_eq!(
            state.disabled_reason.as_deref(),
            Some("billing_error: card declined")
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn rate_limit_and_transient_outcomes_leave_state_unchanged() {
        let providers = runtime(&["a"], MemoryStore::new());
        for outcome in [ProviderOutcome::RateLimited, ProviderOutcome::TransientError] {
            let changed = providers
                .report_outcome("a", outcome, None)
                .await
                .expect("report should succeed");
            assert!(!changed);
        }
        assert!(providers.state("a").expect("state").is_eligible());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn only_clear_or_manual_enable_restore_eligibility() {
        let providers = runtime(&["a"], MemoryStore::new());
        providers
            .report_outcome("a", ProviderOutcome::AuthError, None)
            .await
            .expect("report");
        assert_eq!(providers.select_provider(), None);

        providers.set_enabled("a", true).await.expect("set enabled");
        assert_eq!(providers.select_provider(), None);

        providers.clear_auto_disable("a").await.expect("clear");
        assert_eq!(providers.select_provider().as_deref(), Some("a"));

        providers.set_enabled("a", false).await.expect("disable");
        assert_eq!(providers.select_provider(), None);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn state_survives_reload_from_store() {
        let store = MemoryStore::new();
        let first = runtime(&["a", "b"], store.clone());
        first
            .report_outcome("a", ProviderOutcome::AuthError, None)
            .await
            .expect("report");

        let second = runtime(&["a", "b"], store);
        second.load().await.expect("load");
        assert_eq!(second.select_provider().as_deref(), Some("b"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_failure_reports_disable_exactly_once() {
        let providers = Arc::new(runtime(&["a", "b"], MemoryStore::new()));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let providers = providers.clone();
            handles.push(tokio::spawn(async move {
                providers
                    .report_outcome("a", ProviderOutcome::AuthError, None)
                    .await
                    .expect("report")
            }));
        }

        let mut disabled_count = 0;
        for handle in handles {
            if handle.await.expect("join") {
                disabled_count += 1;
            }
        }
        assert_eq!(disabled_count, 1);
        assert_eq!(providers.select_provider().as_deref(), Some("b"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unknown_provider_is_rejected() {
        let providers = runtime(&["a"], MemoryStore::new());
        let error = providers
            .set_enabled("zzz", false)
            .await
            .expect_err("unknown provider should fail");
        assert!(matches!(error, AgentError::UnknownProvider(_)));
    }
}
