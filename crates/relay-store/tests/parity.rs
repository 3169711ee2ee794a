use chrono::{Duration, Utc};
use relay_store::{
    CleanupMode, FsStore, MemoryStore, ProviderState, ProviderStateStore, RunStatus, RunStore,
    StoreError, StoreResult, SubagentRun,
};

fn run(id: &str, age_secs: i64) -> SubagentRun {
    let mut run = SubagentRun::new(id, "parent", format!("child-{id}"), "task", CleanupMode::Keep);
    run.created_at = Utc::now() - Duration::seconds(age_secs);
    run
}

async fn exercise_run_lifecycle<T: RunStore>(store: &T) -> StoreResult<()> {
    store.create_run(run("run-b", 10)).await?;
    store.create_run(run("run-a", 20)).await?;
    store.create_run(run("run-c", 5)).await?;

    let duplicate = store.create_run(run("run-a", 1)).await;
    assert!(matches!(duplicate, Err(StoreError::Conflict(_))));

    let mut updated = store.get_run("run-b").await?.expect("run-b exists");
    updated.status = RunStatus::Completed;
    updated.result = Some("done".to_string());
    updated.ended_at = Some(Utc::now());
    store.update_run(updated.clone()).await?;
    assert_eq!(store.get_run("run-b").await?, Some(updated));

    let ids: Vec<String> = store.list_runs().await?.into_iter().map(|run| run.id).collect();
    assert_eq!(ids, vec!["run-a", "run-b", "run-c"]);

    let missing = store.update_run(run("ghost", 0)).await;
    assert!(matches!(missing, Err(StoreError::NotFound { resource: "run", .. })));
    assert_eq!(store.get_run("ghost").await?, None);
    Ok(())
}

async fn exercise_provider_states<T: ProviderStateStore>(store: &T) -> StoreResult<()> {
    let mut alpha = ProviderState::new("alpha");
    store.put_provider_state(alpha.clone()).await?;
    store.put_provider_state(ProviderState::new("beta")).await?;

    alpha.auto_disabled = true;
    alpha.disabled_reason = Some("auth_error: revoked".to_string());
    alpha.updated_at = Utc::now();
    store.put_provider_state(alpha.clone()).await?;

    assert_eq!(store.get_provider_state("alpha").await?, Some(alpha));
    assert_eq!(store.get_provider_state("gamma").await?, None);
    assert_eq!(store.list_provider_states().await?.len(), 2);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn memory_store_conformance() {
    let store = MemoryStore::new();
    exercise_run_lifecycle(&store).await.expect("runs");
    exercise_provider_states(&store).await.expect("providers");
}

#[tokio::test(flavor = "current_thread")]
async fn fs_store_conformance() {
    let tmp = tempfile::tempdir().expect("tempdir should be created");
    let store = FsStore::new(tmp.path()).expect("fs store should initialize");
    exercise_run_lifecycle(&store).await.expect("runs");
    exercise_provider_states(&store).await.expect("providers");
}

#[tokio::test(flavor = "current_thread")]
async fn fs_store_reopen_keeps_in_flight_runs_for_recovery() {
    let tmp = tempfile::tempdir().expect("tempdir should be created");
    {
        let store = FsStore::new(tmp.path()).expect("fs store should initialize");
        let mut running = run("run-live", 3);
        running.status = RunStatus::Running;
        running.started_at = Some(Utc::now());
        store.create_run(running).await.expect("create running");

        let mut finished = run("run-done", 6);
        finished.status = RunStatus::Failed;
        finished.error = Some("provider exhausted".to_string());
        store.create_run(finished).await.expect("create finished");
    }

    let reopened = FsStore::new(tmp.path()).expect("fs store should reopen");
    let runs = reopened.list_runs().await.expect("list");
    let statuses: Vec<(String, RunStatus)> =
        runs.into_iter().map(|run| (run.id, run.status)).collect();
    assert_eq!(
        statuses,
        vec![
            ("run-done".to_string(), RunStatus::Failed),
            ("run-live".to_string(), RunStatus::Running),
        ]
    );
}
