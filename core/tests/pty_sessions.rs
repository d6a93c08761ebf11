#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

// Real-PTY scenarios live in their own test binary so the backend override
// used by the fallback test can never leak into them.

use std::time::Duration;

use pi_bash_core::SessionConfig;
use pi_bash_core::SessionStatus;
use pi_bash_core::SessionTools;
use pi_bash_core::StdinMode;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn tools() -> SessionTools {
    SessionTools::new(SessionConfig {
        job_ttl_ms: 0,
        ..SessionConfig::default()
    })
}

#[tokio::test]
async fn pty_session_reports_merged_output() {
    let tools = tools();
    let result = tools
        .bash(
            json!({"command": "printf 'from-pty\\n'", "stdinMode": "pty", "yieldMs": 10000}),
            CancellationToken::new(),
            None,
        )
        .await;

    assert_eq!(result.details.status, SessionStatus::Completed);
    assert_eq!(result.details.stdin_mode, Some(StdinMode::Pty));
    assert!(result.text_joined().contains("from-pty"));
}

#[tokio::test]
async fn pty_write_and_ctrl_d_end_an_interactive_cat() {
    let tools = tools();
    let result = tools
        .bash(
            json!({"command": "cat", "background": true, "stdinMode": "pty"}),
            CancellationToken::new(),
            None,
        )
        .await;
    assert_eq!(result.details.status, SessionStatus::Running);
    let session_id = result.details.session_id.clone().unwrap();

    tools
        .process(json!({"action": "write", "sessionId": session_id, "data": "ping\n"}))
        .await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    let poll = tools
        .process(json!({"action": "poll", "sessionId": session_id}))
        .await;
    assert!(poll.text_joined().contains("ping"));

    // Ctrl-D closes the interactive cat; the session finishes cleanly.
    tools
        .process(json!({"action": "write", "sessionId": session_id, "data": "", "eof": true}))
        .await;

    let mut finished = false;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let poll = tools
            .process(json!({"action": "poll", "sessionId": session_id}))
            .await;
        if poll.details.status != SessionStatus::Running {
            assert_eq!(poll.details.status, SessionStatus::Completed);
            finished = true;
            break;
        }
    }
    assert!(finished, "cat did not exit after Ctrl-D");
}

#[tokio::test]
async fn pty_kill_tears_down_the_process_group() {
    let tools = tools();
    let result = tools
        .bash(
            json!({"command": "sleep 60", "background": true, "stdinMode": "pty"}),
            CancellationToken::new(),
            None,
        )
        .await;
    let session_id = result.details.session_id.clone().unwrap();

    let killed = tools
        .process(json!({"action": "kill", "sessionId": session_id}))
        .await;
    assert_eq!(killed.details.status, SessionStatus::Failed);
    assert_eq!(killed.details.exit_signal.as_deref(), Some("SIGKILL"));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(tools.registry().get(&session_id).await.is_none());
    assert!(tools.registry().get_finished(&session_id).await.is_some());
}
