mod support;

use relay_agent::{EventKind, TurnState};
use relay_llm::{ContentPart, Message, Role};
use serde_json::json;
use std::time::Duration;
use support::{SequenceAdapter, harness, text_response, tool_call_response};
use tokio_util::sync::CancellationToken;

fn tool_results(messages: &[Message]) -> Vec<(String, bool, String)> {
    messages
        .iter()
        .flat_map(|message| message.content.iter())
        .filter_map(|part| match part {
            ContentPart::ToolResult(result) => Some((
                result.tool_call_id.clone(),
                result.is_error,
                result.content.as_str().unwrap_or_default().to_string(),
            )),
            _ => None,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn provider_that_never_stops_calling_tools_hits_the_round_limit() {
    let adapter = SequenceAdapter::new("a");
    adapter.always(tool_call_response("a", vec![("call", "noop", json!({}))]));
    let h = harness(&[adapter.clone()], |config| config.turn.max_tool_rounds = 3);
    let conversation = h.conversation();

    let outcome = h
        .runtime
        .run_turn(&conversation, "keep going")
        .await
        .expect("turn should finish");

    assert_eq!(outcome.state, TurnState::Finalized);
    assert!(outcome.degraded);
    assert!(!outcome.reply.trim().is_empty());
    assert_eq!(outcome.iterations, 3);
    assert_eq!(outcome.tool_error_count, 3);
    assert_eq!(adapter.request_count(), 4);
    assert!(h.events.kinds().contains(&EventKind::TurnLimit));

    let history = h
        .runtime
        .conversations()
        .messages(&conversation)
        .expect("history");
    let last = history.last().expect("final message");
    assert_eq!(last.role, Role::Assistant);
    assert_eq!(last.text(), outcome.reply);
}

#[tokio::test(flavor = "multi_thread")]
async fn parallel_round_results_are_appended_in_issue_order() {
    let adapter = SequenceAdapter::new("a");
    adapter.enqueue(Ok(tool_call_response(
        "a",
        vec![
            ("c1", "read_file", json!({"file_path": "first.txt"})),
            ("c2", "missing_tool", json!({})),
            ("c3", "read_file", json!({"file_path": "second.txt"})),
        ],
    )));
    adapter.enqueue(Ok(text_response("a", "done")));
    let h = harness(&[adapter.clone()], |config| config.turn.parallel_tool_calls = true);
    std::fs::write(h.workspace.path().join("first.txt"), "alpha\n").expect("seed");
    std::fs::write(h.workspace.path().join("second.txt"), "beta\n").expect("seed");
    let conversation = h.conversation();

    let outcome = h
        .runtime
        .run_turn(&conversation, "read both files")
        .await
        .expect("turn should finish");
    assert_eq!(outcome.reply, "done");
    assert_eq!(outcome.tool_call_count, 3);
    assert_eq!(outcome.tool_error_count, 1);

    let requests = adapter.requests();
    assert_eq!(requests.len(), 2);
    let results = tool_results(&requests[1].messages);
    let ids: Vec<&str> = results.iter().map(|(id, _, _)| id.as_str()).collect();
    assert_eq!(ids, vec!["c1", "c2", "c3"]);
    assert!(results[0].2.contains("alpha"));
    assert!(results[1].1, "unknown tool should be an error result");
    assert!(results[1].2.contains("Unknown tool: missing_tool"));
    assert!(results[2].2.contains("beta"));

    let history = h
        .runtime
        .conversations()
        .messages(&conversation)
        .expect("history");
    assert_eq!(history.len(), 6);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[5].text(), "done");
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_reply_to_exec_request_falls_back_to_the_requested_command() {
    let adapter = SequenceAdapter::new("a");
    adapter.enqueue(Ok(text_response("a", "")));
    adapter.enqueue(Ok(text_response("a", "printed it")));
    let h = harness(&[adapter.clone()], |_| {});
    let conversation = h.conversation();

    let outcome = h
        .runtime
        .run_turn(&conversation, "run echo fallback-ok")
        .await
        .expect("turn should finish");

    assert_eq!(outcome.reply, "printed it");
    assert_eq!(outcome.tool_call_count, 1);
    assert!(h.events.kinds().contains(&EventKind::ExecFallback));
    let results = tool_results(&adapter.requests()[1].messages);
    assert_eq!(results.len(), 1);
    assert!(!results[0].1);
    assert!(results[0].2.contains("fallback-ok"));
}

#[tokio::test(flavor = "multi_thread")]
async fn nameless_tool_call_recovers_the_command_from_a_fenced_block() {
    let adapter = SequenceAdapter::new("a");
    let mut garbled = tool_call_response("a", vec![("call-1", "", json!({}))]);
    garbled.message.content.insert(
        0,
        ContentPart::text("Running it now:\n```bash\necho fenced-ok\n```"),
    );
    adapter.enqueue(Ok(garbled));
    adapter.enqueue(Ok(text_response("a", "done")));
    let h = harness(&[adapter.clone()], |_| {});
    let conversation = h.conversation();

    let outcome = h
        .runtime
        .run_turn(&conversation, "run the greeting script")
        .await
        .expect("turn should finish");

    assert_eq!(outcome.reply, "done");
    assert!(h.events.kinds().contains(&EventKind::ExecFallback));
    let results = tool_results(&adapter.requests()[1].messages);
    assert_eq!(results.len(), 1);
    assert!(!results[0].1);
    assert!(results[0].2.contains("fenced-ok"));
}

#[tokio::test(flavor = "multi_thread")]
async fn conversational_turns_never_trigger_the_exec_fallback() {
    let adapter = SequenceAdapter::new("a");
    adapter.enqueue(Ok(text_response("a", "")));
    let h = harness(&[adapter.clone()], |_| {});
    let conversation = h.conversation();

    let outcome = h
        .runtime
        .run_turn(&conversation, "tell me about running shoes")
        .await
        .expect("turn should finish");

    assert_eq!(outcome.reply, "");
    assert_eq!(outcome.tool_call_count, 0);
    assert_eq!(adapter.request_count(), 1);
    assert!(!h.events.kinds().contains(&EventKind::ExecFallback));
}

#[tokio::test(flavor = "multi_thread")]
async fn turns_of_one_conversation_run_one_at_a_time() {
    let adapter = SequenceAdapter::new("a").with_delay(Duration::from_millis(100));
    adapter.enqueue(Ok(text_response("a", "first reply")));
    adapter.enqueue(Ok(text_response("a", "second reply")));
    let h = harness(&[adapter.clone()], |_| {});
    let conversation = h.conversation();

    let executor = h.runtime.executor().clone();
    let (first, second) = tokio::join!(
        executor.run_turn(&conversation, "first"),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            executor.run_turn(&conversation, "second").await
        }
    );
    assert_eq!(first.expect("first turn").reply, "first reply");
    assert_eq!(second.expect("second turn").reply, "second reply");

    let texts: Vec<String> = h
        .runtime
        .conversations()
        .messages(&conversation)
        .expect("history")
        .iter()
        .map(Message::text)
        .collect();
    assert_eq!(texts, vec!["first", "first reply", "second", "second reply"]);

    // The second request must have seen the whole first exchange.
    assert_eq!(adapter.requests()[1].messages.len(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_turn_is_aborted_and_keeps_only_the_user_message() {
    let adapter = SequenceAdapter::new("a").with_delay(Duration::from_secs(5));
    let h = harness(&[adapter], |_| {});
    let conversation = h.conversation();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let outcome = h
        .runtime
        .executor()
        .run_turn_with_cancel(&conversation, "slow question", cancel)
        .await
        .expect("aborted turn still reports an outcome");

    assert_eq!(outcome.state, TurnState::Aborted);
    let history = h
        .runtime
        .conversations()
        .messages(&conversation)
        .expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].text(), "slow question");
}
