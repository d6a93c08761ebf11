#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use pi_bash_core::SessionConfig;
use pi_bash_core::SessionStatus;
use pi_bash_core::SessionTools;
use pi_bash_core::StdinMode;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn tools() -> SessionTools {
    // Sweeping is irrelevant to these scenarios; keep sessions around.
    SessionTools::new(SessionConfig {
        job_ttl_ms: 0,
        ..SessionConfig::default()
    })
}

fn cancel() -> CancellationToken {
    CancellationToken::new()
}

#[tokio::test]
async fn fast_command_completes_within_the_yield_window() {
    let tools = tools();
    let result = tools
        .bash(json!({"command": "echo hi", "yieldMs": 5000}), cancel(), None)
        .await;

    assert_eq!(result.details.status, SessionStatus::Completed);
    assert_eq!(result.details.exit_code, Some(0));
    assert!(result.text_joined().contains("hi"));

    let finished = tools.registry().list_finished().await;
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].exit_record().unwrap().exit_code, Some(0));
    assert!(tools.registry().list_running().await.is_empty());
}

#[tokio::test]
async fn slow_command_yields_then_finishes_in_the_background() {
    let tools = tools();
    let result = tools
        .bash(
            json!({"command": "sleep 1 && echo done", "yieldMs": 50}),
            cancel(),
            None,
        )
        .await;

    assert_eq!(result.details.status, SessionStatus::Running);
    let session_id = result.details.session_id.clone().unwrap();
    assert!(result.text_joined().contains(&session_id));

    let early = tools
        .process(json!({"action": "poll", "sessionId": session_id}))
        .await;
    assert_eq!(early.details.status, SessionStatus::Running);
    assert!(early.text_joined().contains("(no new output)"));

    tokio::time::sleep(Duration::from_millis(2_000)).await;

    let late = tools
        .process(json!({"action": "poll", "sessionId": session_id}))
        .await;
    assert_eq!(late.details.status, SessionStatus::Completed);
    assert_eq!(late.details.exit_code, Some(0));
    assert!(late.text_joined().contains("done"));
}

#[tokio::test]
async fn timeout_kills_the_process_tree_and_fails_the_run() {
    let tools = tools();
    let result = tools
        .bash(
            json!({"command": "sleep 60", "timeout": 1, "yieldMs": 120000}),
            cancel(),
            None,
        )
        .await;

    assert_eq!(result.details.status, SessionStatus::Failed);
    assert!(result.text_joined().contains("timed out after 1 seconds"));

    let finished = tools.registry().list_finished().await;
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].status(), SessionStatus::Failed);
}

#[tokio::test]
async fn cancellation_before_the_yield_timer_fails_the_run() {
    let tools = tools();
    let token = cancel();
    let cancel_after = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel_after.cancel();
    });

    let result = tools
        .bash(json!({"command": "sleep 60", "yieldMs": 120000}), token, None)
        .await;
    assert_eq!(result.details.status, SessionStatus::Failed);
    assert!(tools.registry().list_running().await.is_empty());
}

#[tokio::test]
async fn pty_request_falls_back_to_pipe_mode_when_the_backend_is_unavailable() {
    pi_bash_utils_pty::override_backend_status_for_tests(Some(Err(
        "forced failure for test".to_string(),
    )));

    let tools = tools();
    let result = tools
        .bash(
            json!({"command": "echo fallback-ok", "stdinMode": "pty", "yieldMs": 5000}),
            cancel(),
            None,
        )
        .await;

    pi_bash_utils_pty::override_backend_status_for_tests(None);

    let text = result.text_joined();
    assert!(text.starts_with("Warning: "), "got: {text}");
    assert!(text.contains("falling back to pipe mode."), "got: {text}");
    assert!(text.contains("fallback-ok"));
    assert_eq!(result.details.status, SessionStatus::Completed);
    assert_eq!(result.details.stdin_mode, Some(StdinMode::Pipe));
}

#[tokio::test]
async fn write_then_eof_drives_a_backgrounded_cat() {
    let tools = tools();
    let result = tools
        .bash(
            json!({"command": "cat", "background": true, "stdinMode": "pipe"}),
            cancel(),
            None,
        )
        .await;
    assert_eq!(result.details.status, SessionStatus::Running);
    let session_id = result.details.session_id.clone().unwrap();

    let write = tools
        .process(json!({"action": "write", "sessionId": session_id, "data": "line\n"}))
        .await;
    assert_eq!(write.details.status, SessionStatus::Running);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let poll = tools
        .process(json!({"action": "poll", "sessionId": session_id}))
        .await;
    assert!(poll.text_joined().contains("line"));
    assert_eq!(poll.details.status, SessionStatus::Running);

    let eof = tools
        .process(json!({"action": "write", "sessionId": session_id, "data": "", "eof": true}))
        .await;
    assert_eq!(eof.details.status, SessionStatus::Running);

    tokio::time::sleep(Duration::from_millis(700)).await;
    let done = tools
        .process(json!({"action": "poll", "sessionId": session_id}))
        .await;
    assert_eq!(done.details.status, SessionStatus::Completed);
    assert_eq!(done.details.exit_code, Some(0));
}

#[tokio::test]
async fn aggregated_output_is_capped_and_counted() {
    let tools = SessionTools::new(SessionConfig {
        max_output_chars: 10_000,
        job_ttl_ms: 0,
        ..SessionConfig::default()
    });

    let result = tools
        .bash(
            json!({
                "command": "head -c 200000 /dev/zero | tr '\\0' 'x'",
                "yieldMs": 60000
            }),
            cancel(),
            None,
        )
        .await;

    assert_eq!(result.details.status, SessionStatus::Completed);
    assert_eq!(result.details.truncated, Some(true));

    let session_id = result.details.session_id.unwrap();
    let session = tools.registry().get_finished(&session_id).await.unwrap();
    let snapshot = session.output_snapshot();
    assert_eq!(snapshot.aggregated.chars().count(), 10_000);
    assert!(snapshot.total_output_chars >= 200_000);
    assert!(snapshot.truncated);
}

#[tokio::test]
async fn kill_clear_and_remove_manage_the_session_sets() {
    let tools = tools();

    let first = tools
        .bash(json!({"command": "sleep 30", "background": true}), cancel(), None)
        .await;
    let first_id = first.details.session_id.clone().unwrap();

    let listing = tools.process(json!({"action": "list"})).await;
    let sessions = listing.details.sessions.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, first_id);
    assert_eq!(sessions[0].status, SessionStatus::Running);

    let killed = tools
        .process(json!({"action": "kill", "sessionId": first_id}))
        .await;
    assert_eq!(killed.details.status, SessionStatus::Failed);
    assert_eq!(killed.details.exit_signal.as_deref(), Some("SIGKILL"));

    // Killed sessions land in the finished set and can be cleared.
    assert!(tools.registry().get_finished(&first_id).await.is_some());
    let cleared = tools
        .process(json!({"action": "clear", "sessionId": first_id}))
        .await;
    assert_eq!(cleared.details.status, SessionStatus::Completed);
    assert!(tools.registry().get_finished(&first_id).await.is_none());

    // Remove kills live sessions outright.
    let second = tools
        .bash(json!({"command": "sleep 30", "background": true}), cancel(), None)
        .await;
    let second_id = second.details.session_id.clone().unwrap();
    let removed = tools
        .process(json!({"action": "remove", "sessionId": second_id}))
        .await;
    assert_eq!(removed.details.status, SessionStatus::Completed);
    assert!(tools.registry().get(&second_id).await.is_none());
    assert!(tools.registry().get_finished(&second_id).await.is_none());
}

#[tokio::test]
async fn workdir_is_respected_and_validated() -> anyhow::Result<()> {
    let tools = tools();
    let dir = tempfile::tempdir()?;

    let result = tools
        .bash(
            json!({"command": "pwd", "workdir": dir.path(), "yieldMs": 5000}),
            cancel(),
            None,
        )
        .await;
    assert_eq!(result.details.status, SessionStatus::Completed);
    let marker = dir.path().file_name().unwrap().to_string_lossy().into_owned();
    assert!(result.text_joined().contains(&marker));

    let missing = tools
        .bash(
            json!({"command": "pwd", "workdir": "/definitely/not/a/dir"}),
            cancel(),
            None,
        )
        .await;
    assert_eq!(missing.details.status, SessionStatus::Failed);
    assert!(missing.text_joined().contains("working directory does not exist"));
    Ok(())
}

#[tokio::test]
async fn missing_sessions_produce_distinct_failures() {
    let tools = tools();

    let poll = tools
        .process(json!({"action": "poll", "sessionId": "no-such-id"}))
        .await;
    assert_eq!(poll.details.status, SessionStatus::Failed);
    assert!(poll.text_joined().contains("no session"));

    let write = tools
        .process(json!({"action": "write", "sessionId": "no-such-id", "data": "x"}))
        .await;
    assert!(write.text_joined().contains("no running session"));

    let clear = tools
        .process(json!({"action": "clear", "sessionId": "no-such-id"}))
        .await;
    assert!(clear.text_joined().contains("no finished session"));
}

#[tokio::test]
async fn log_reads_slices_of_finished_output() {
    let tools = tools();
    let result = tools
        .bash(
            json!({"command": "printf 'a\\nb\\nc\\nd\\n'", "yieldMs": 5000}),
            cancel(),
            None,
        )
        .await;
    assert_eq!(result.details.status, SessionStatus::Completed);
    let session_id = result.details.session_id.unwrap();

    let tail_view = tools
        .process(json!({"action": "log", "sessionId": session_id, "limit": 2}))
        .await;
    assert_eq!(tail_view.text_joined(), "c\nd");
    assert_eq!(tail_view.details.total_lines, Some(4));

    let window = tools
        .process(json!({"action": "log", "sessionId": session_id, "offset": 1, "limit": 2}))
        .await;
    assert_eq!(window.text_joined(), "b\nc");
}

#[tokio::test]
async fn progress_updates_carry_the_session_tail() {
    let tools = tools();
    let (update_tx, update_rx) = async_channel::unbounded();

    let result = tools
        .bash(
            json!({"command": "echo streamed", "yieldMs": 5000}),
            cancel(),
            Some(update_tx),
        )
        .await;
    assert_eq!(result.details.status, SessionStatus::Completed);

    let update = update_rx.recv().await.unwrap();
    assert_eq!(update.status, SessionStatus::Running);
    assert!(update.tail.contains("streamed"));
}
