//! Agent control loop tests against an in-process fake guest and scripted
//! LLM providers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use agentvisor::agent::{AgentConfig, AgentController, SessionHandle, SessionState};
use agentvisor::llm::LlmProvider;
use agentvisor::trace::{read_trace, TraceEventKind, TraceWriter};

use common::*;

fn controller_with(
    provider: Arc<dyn LlmProvider>,
    fail_methods: &[&str],
    trace_path: &std::path::Path,
) -> (AgentController, SessionHandle, Arc<std::sync::Mutex<Vec<String>>>) {
    let (transport, served) = spawn_guest(fail_methods);
    let registry = guest_registry(Arc::clone(&transport));
    let trace = TraceWriter::open(trace_path).unwrap();
    let (controller, handle) = AgentController::new(
        "task-test",
        "vm-test",
        provider,
        registry,
        transport,
        trace,
        AgentConfig::default(),
    );
    (controller, handle, served)
}

/// Poll until the predicate holds or the deadline passes.
async fn wait_until<F: Fn() -> bool>(pred: F, what: &str) {
    for _ in 0..200 {
        if pred() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn zero_tool_calls_completes_with_summary() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![text_response(
        "The flight is booked.",
    )]));
    let (controller, _handle, _) =
        controller_with(provider.clone(), &[], &tmp.path().join("t.ndjson"));

    let report = controller.run("book a flight").await;

    assert_eq!(report.state, SessionState::Completed);
    assert_eq!(report.summary.as_deref(), Some("The flight is booked."));
    assert_eq!(report.steps, 1);
    assert_eq!(provider.call_count(), 1);

    let events = read_trace(tmp.path().join("t.ndjson")).unwrap();
    assert!(matches!(events[0].kind, TraceEventKind::SessionStart { .. }));
    assert!(matches!(
        events.last().unwrap().kind,
        TraceEventKind::SessionEnd { .. }
    ));
}

#[tokio::test]
async fn step_counter_increments_once_per_iteration() {
    let tmp = tempfile::tempdir().unwrap();
    // Two tool-calling iterations (the second with two calls), then a
    // terminal answer: exactly three steps.
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_response(&[("mouseClick", json!({"x": 1, "y": 2}))]),
        tool_response(&[
            ("keyboardType", json!({"text": "hello"})),
            ("mouseMove", json!({"x": 3, "y": 4})),
        ]),
        text_response("done"),
    ]));
    let (controller, _handle, served) =
        controller_with(provider.clone(), &[], &tmp.path().join("t.ndjson"));

    let report = controller.run("type a greeting").await;

    assert_eq!(report.state, SessionState::Completed);
    assert_eq!(report.steps, 3);
    assert_eq!(provider.call_count(), 3);

    // Tool calls ran in the order the model emitted them.
    let served = served.lock().unwrap();
    let actions: Vec<&String> = served.iter().filter(|m| *m != "screenshot").collect();
    assert_eq!(actions, vec!["mouseClick", "keyboardType", "mouseMove"]);
}

#[tokio::test]
async fn tokens_accumulate_across_steps() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_response(&[("mouseClick", json!({"x": 1, "y": 2}))]),
        text_response("done"),
    ]));
    let (controller, _handle, _) =
        controller_with(provider, &[], &tmp.path().join("t.ndjson"));

    let report = controller.run("click").await;
    // Two completions at 15 total tokens each
    assert_eq!(report.tokens.total, 30);
    assert_eq!(report.tokens.prompt, 20);
    assert_eq!(report.tokens.completion, 10);
}

#[tokio::test]
async fn guest_refusal_feeds_back_as_failed_tool_result() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_response(&[("openApp", json!({"name": "Safari"}))]),
        text_response("gave up"),
    ]));
    let (controller, handle, _) = controller_with(
        provider,
        &["openApp"],
        &tmp.path().join("t.ndjson"),
    );

    let report = controller.run("open safari").await;

    // A guest-side refusal is not fatal: the loop kept going.
    assert_eq!(report.state, SessionState::Completed);
    let history = handle.snapshot().history;
    let tool_msg = history.iter().find(|m| m.role == "tool").unwrap();
    assert!(tool_msg.content.contains("error"));

    let events = read_trace(tmp.path().join("t.ndjson")).unwrap();
    assert!(events.iter().any(|e| matches!(
        &e.kind,
        TraceEventKind::ToolResult { success: false, .. }
    )));
}

#[tokio::test]
async fn unknown_tool_name_feeds_back_not_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_response(&[("summonDragon", json!({}))]),
        text_response("done"),
    ]));
    let (controller, handle, _) =
        controller_with(provider, &[], &tmp.path().join("t.ndjson"));

    let report = controller.run("do something").await;
    assert_eq!(report.state, SessionState::Completed);
    let history = handle.snapshot().history;
    let tool_msg = history.iter().find(|m| m.role == "tool").unwrap();
    assert!(tool_msg.content.contains("tool not found"));
}

#[tokio::test]
async fn cancel_interrupts_in_flight_llm_call() {
    let tmp = tempfile::tempdir().unwrap();
    let (controller, handle, _) = controller_with(
        Arc::new(HangingProvider),
        &[],
        &tmp.path().join("t.ndjson"),
    );

    let run = tokio::spawn(controller.run("never finishes"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.cancel();

    let report = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("cancel must interrupt the hung call")
        .unwrap();
    assert_eq!(report.state, SessionState::Cancelled);
    assert_eq!(handle.state(), SessionState::Cancelled);
}

#[tokio::test]
async fn question_parks_until_answered() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_response(&[(
            "askTextQuestion",
            json!({"question": "Which account should I use?"}),
        )]),
        text_response("used the blue account"),
    ]));
    let (controller, handle, _) =
        controller_with(provider.clone(), &[], &tmp.path().join("t.ndjson"));

    let run = tokio::spawn(controller.run("log in"));

    let h = handle.clone();
    wait_until(
        || h.snapshot().pending_question.is_some(),
        "pending question",
    )
    .await;
    let question = handle.snapshot().pending_question.unwrap();
    assert_eq!(question.question, "Which account should I use?");
    // Only one LLM call so far: the loop is parked, not spinning.
    assert_eq!(provider.call_count(), 1);

    assert!(handle.answer_question("the blue one"));

    let report = run.await.unwrap();
    assert_eq!(report.state, SessionState::Completed);
    assert!(handle.snapshot().pending_question.is_none());

    // The answer went back to the model as the tool result.
    let history = handle.snapshot().history;
    let tool_msg = history.iter().find(|m| m.role == "tool").unwrap();
    assert!(tool_msg.content.contains("the blue one"));
}

#[tokio::test]
async fn denied_permission_feeds_error_and_skips_the_tool() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_response(&[("runShell", json!({"command": "rm -rf /tmp/x"}))]),
        text_response("understood"),
    ]));
    let (controller, handle, served) =
        controller_with(provider, &[], &tmp.path().join("t.ndjson"));

    let run = tokio::spawn(controller.run("clean up"));

    let h = handle.clone();
    wait_until(
        || h.snapshot().pending_permission.is_some(),
        "pending permission",
    )
    .await;
    assert_eq!(
        handle.snapshot().pending_permission.as_deref(),
        Some("runShell")
    );
    assert!(handle.resolve_permission(false));

    let report = run.await.unwrap();
    assert_eq!(report.state, SessionState::Completed);

    // The denied command never reached the guest.
    assert!(!served.lock().unwrap().iter().any(|m| m == "runShell"));
    let history = handle.snapshot().history;
    let tool_msg = history.iter().find(|m| m.role == "tool").unwrap();
    assert!(tool_msg.content.contains("permission denied"));
}

#[tokio::test]
async fn granted_permission_dispatches_the_tool() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_response(&[("runShell", json!({"command": "ls"}))]),
        text_response("done"),
    ]));
    let (controller, handle, served) =
        controller_with(provider, &[], &tmp.path().join("t.ndjson"));

    let run = tokio::spawn(controller.run("list files"));
    let h = handle.clone();
    wait_until(
        || h.snapshot().pending_permission.is_some(),
        "pending permission",
    )
    .await;
    assert!(handle.resolve_permission(true));

    let report = run.await.unwrap();
    assert_eq!(report.state, SessionState::Completed);
    assert!(served.lock().unwrap().iter().any(|m| m == "runShell"));
}

#[tokio::test]
async fn pause_before_first_step_defers_all_llm_calls() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![text_response("done")]));
    let (controller, handle, _) =
        controller_with(provider.clone(), &[], &tmp.path().join("t.ndjson"));

    handle.pause();
    let run = tokio::spawn(controller.run("wait for it"));

    let h = handle.clone();
    wait_until(|| h.state() == SessionState::Paused, "paused state").await;
    assert_eq!(provider.call_count(), 0);

    handle.resume();
    let report = run.await.unwrap();
    assert_eq!(report.state, SessionState::Completed);
    assert_eq!(provider.call_count(), 1);
}

#[tokio::test]
async fn pause_mid_run_lets_the_current_step_finish() {
    let tmp = tempfile::tempdir().unwrap();
    let (provider, gate) = GatedProvider::new(vec![
        tool_response(&[("mouseClick", json!({"x": 1, "y": 2}))]),
        text_response("done"),
    ]);
    let (controller, handle, served) = controller_with(
        provider.clone(),
        &[],
        &tmp.path().join("t.ndjson"),
    );

    let run = tokio::spawn(controller.run("click something"));

    // Pause while the first completion is still in flight.
    let p = Arc::clone(&provider);
    wait_until(
        || p.in_flight() == 1,
        "first LLM call in flight",
    )
    .await;
    handle.pause();
    gate.add_permits(1);

    // The in-flight step runs its tool call to completion, then parks.
    let h = handle.clone();
    wait_until(|| h.state() == SessionState::Paused, "paused state").await;
    assert!(served.lock().unwrap().iter().any(|m| m == "mouseClick"));
    assert_eq!(provider.calls.load(std::sync::atomic::Ordering::SeqCst), 1);

    handle.resume();
    gate.add_permits(1);
    let report = run.await.unwrap();
    assert_eq!(report.state, SessionState::Completed);
    assert_eq!(report.steps, 2);
}

#[tokio::test]
async fn lost_transport_fails_the_session() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![]));
    let (transport, _) = spawn_guest(&[]);
    let registry = guest_registry(Arc::clone(&transport));
    let trace = TraceWriter::open(tmp.path().join("t.ndjson")).unwrap();
    let (controller, _handle) = AgentController::new(
        "task-test",
        "vm-test",
        provider,
        registry,
        Arc::clone(&transport),
        trace,
        AgentConfig::default(),
    );

    // Sever the connection before the first observation.
    transport.close();
    let report = controller.run("doomed").await;

    assert_eq!(report.state, SessionState::Failed);
    assert!(report.error.unwrap().contains("transport"));
}

#[tokio::test]
async fn step_limit_fails_the_session() {
    let tmp = tempfile::tempdir().unwrap();
    // Endless tool-calling responses; never a terminal answer.
    let provider = Arc::new(ScriptedProvider::new(
        (0..10)
            .map(|_| tool_response(&[("mouseMove", json!({"x": 0, "y": 0}))]))
            .collect(),
    ));
    let (transport, _) = spawn_guest(&[]);
    let registry = guest_registry(Arc::clone(&transport));
    let trace = TraceWriter::open(tmp.path().join("t.ndjson")).unwrap();
    let (controller, _handle) = AgentController::new(
        "task-test",
        "vm-test",
        provider,
        registry,
        transport,
        trace,
        AgentConfig {
            max_steps: 3,
            ..Default::default()
        },
    );

    let report = controller.run("loop forever").await;
    assert_eq!(report.state, SessionState::Failed);
    assert_eq!(report.steps, 3);
    assert!(report.error.unwrap().contains("step limit"));
}
