mod support;

use relay_agent::{
    EventKind, ExecError, ExecOutcome, ExecRequest, KillOutcome, ProcessAction, ProcessResponse,
    SessionState,
};
use serde_json::json;
use std::time::Duration;
use support::{SequenceAdapter, harness, text_response, tool_call_response};

fn running_session(outcome: ExecOutcome) -> String {
    match outcome {
        ExecOutcome::Running { session_id } => session_id,
        ExecOutcome::Done { output, .. } => panic!("expected a running session, got {output:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn zero_yield_returns_a_session_that_finishes_in_the_background() {
    let h = harness(&[SequenceAdapter::new("a")], |_| {});
    let exec = h.runtime.exec();

    let session_id = running_session(
        exec.exec(ExecRequest {
            yield_ms: Some(0),
            ..ExecRequest::new("sleep 1; echo done")
        })
        .await
        .expect("exec"),
    );

    let first = exec.poll(&session_id).expect("poll");
    assert_eq!(first.state, SessionState::Running);
    assert!(first.terminal_event.is_none());

    let state = exec
        .wait_for_terminal(&session_id, Duration::from_secs(5))
        .await
        .expect("wait");
    assert_eq!(state, SessionState::Exited);

    let finished = exec.poll(&session_id).expect("poll");
    assert_eq!(finished.state, SessionState::Exited);
    assert_eq!(finished.exit_code, Some(0));
    assert!(finished.delta.contains("done"));
    assert!(finished.terminal_event.is_some());

    let again = exec.poll(&session_id).expect("poll");
    assert!(again.delta.is_empty());
    assert!(again.terminal_event.is_none(), "terminal event is reported once");

    let log = exec.log(&session_id, Some(0), None).expect("log");
    assert!(log.content.contains("done"));
}

#[tokio::test(flavor = "multi_thread")]
async fn kill_is_idempotent_and_reports_a_single_terminal_event() {
    let h = harness(&[SequenceAdapter::new("a")], |_| {});
    let exec = h.runtime.exec();

    let session_id = running_session(
        exec.exec(ExecRequest {
            background: true,
            ..ExecRequest::new("sleep 30")
        })
        .await
        .expect("exec"),
    );

    assert_eq!(exec.kill(&session_id).expect("kill"), KillOutcome::Signalled);
    let state = exec
        .wait_for_terminal(&session_id, Duration::from_secs(5))
        .await
        .expect("wait");
    assert_eq!(state, SessionState::Killed);
    assert_eq!(
        exec.kill(&session_id).expect("second kill"),
        KillOutcome::AlreadyTerminal
    );

    let polls: Vec<_> = (0..3)
        .map(|_| exec.poll(&session_id).expect("poll"))
        .collect();
    assert!(polls.iter().all(|poll| poll.state == SessionState::Killed));
    assert_eq!(
        polls
            .iter()
            .filter(|poll| poll.terminal_event.is_some())
            .count(),
        1
    );
    assert!(h.events.kinds().contains(&EventKind::ExecSessionKilled));

    exec.remove(&session_id).expect("remove");
    assert!(matches!(
        exec.poll(&session_id),
        Err(ExecError::SessionNotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn process_actions_drive_a_session_end_to_end() {
    let h = harness(&[SequenceAdapter::new("a")], |_| {});
    let exec = h.runtime.exec();

    let session_id = running_session(
        exec.exec(ExecRequest {
            background: true,
            ..ExecRequest::new("cat")
        })
        .await
        .expect("exec"),
    );

    let listed = exec.process(ProcessAction::List).await.expect("list");
    let ProcessResponse::Sessions { sessions } = listed else {
        panic!("expected a session list");
    };
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, session_id);

    let written = exec
        .process(ProcessAction::Write {
            session_id: session_id.clone(),
            data: "echoed through cat\n".to_string(),
            eof: true,
        })
        .await
        .expect("write");
    assert!(matches!(written, ProcessResponse::Written { bytes: 19, .. }));

    let state = exec
        .wait_for_terminal(&session_id, Duration::from_secs(5))
        .await
        .expect("wait");
    assert_eq!(state, SessionState::Exited);

    let log = exec
        .process(ProcessAction::Log {
            session_id: session_id.clone(),
            offset: None,
            limit: None,
        })
        .await
        .expect("log");
    let ProcessResponse::Log(view) = log else {
        panic!("expected a log view");
    };
    assert!(view.content.contains("echoed through cat"));

    exec.process(ProcessAction::Remove {
        session_id: session_id.clone(),
    })
    .await
    .expect("remove");
    assert!(exec.list().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn exec_tool_in_a_turn_returns_output_and_denials_run_nothing() {
    let adapter = SequenceAdapter::new("a");
    adapter.enqueue(Ok(tool_call_response(
        "a",
        vec![
            ("c1", "exec", json!({"command": "echo from-turn"})),
            ("c2", "exec", json!({"command": "rm -rf /tmp/nothing"})),
        ],
    )));
    adapter.enqueue(Ok(text_response("a", "ran it")));
    let h = harness(&[adapter.clone()], |_| {});
    let conversation = h.conversation();

    let outcome = h
        .runtime
        .run_turn(&conversation, "please run echo")
        .await
        .expect("turn");
    assert_eq!(outcome.reply, "ran it");
    assert_eq!(outcome.tool_call_count, 2);
    assert_eq!(outcome.tool_error_count, 1);

    let requests = adapter.requests();
    let results: Vec<(bool, String)> = requests[1]
        .messages
        .iter()
        .flat_map(|message| message.content.iter())
        .filter_map(|part| match part {
            relay_llm::ContentPart::ToolResult(result) => Some((
                result.is_error,
                result.content.as_str().unwrap_or_default().to_string(),
            )),
            _ => None,
        })
        .collect();
    assert!(!results[0].0);
    assert!(results[0].1.contains("from-turn"));
    assert!(results[0].1.contains("[exit code: 0]"));
    assert!(results[1].0);
    assert!(results[1].1.starts_with("Command denied"));
    assert!(results[1].1.contains("Nothing was executed"));
    assert!(h.runtime.exec().list().is_empty());
}
