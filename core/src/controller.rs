//! Stateless dispatcher for the `process` tool: follow-up actions against
//! sessions the executor has already registered.

use std::sync::Arc;

use crate::error::SessionError;
use crate::executor::abort_session;
use crate::registry::SessionRegistry;
use crate::session::Session;
use crate::session::SessionStatus;
use crate::tools::ProcessAction;
use crate::tools::ProcessToolParams;
use crate::tools::SessionOverview;
use crate::tools::ToolDetails;
use crate::tools::ToolResult;
use crate::truncate::truncate_middle;

const NAME_TARGET_MAX_CHARS: usize = 48;
const ID_PREFIX_CHARS: usize = 8;

pub(crate) async fn handle_process(
    registry: &Arc<SessionRegistry>,
    params: &ProcessToolParams,
) -> Result<ToolResult, SessionError> {
    registry.prune_finished().await;

    if params.action == ProcessAction::List {
        return list(registry).await;
    }

    let session_id = params
        .session_id
        .as_deref()
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| {
            SessionError::invalid_arguments(format!(
                "sessionId is required for action {}",
                params.action
            ))
        })?;

    match params.action {
        ProcessAction::List => unreachable!("handled above"),
        ProcessAction::Poll => poll(registry, session_id).await,
        ProcessAction::Log => log(registry, session_id, params.offset, params.limit).await,
        ProcessAction::Write => {
            write(
                registry,
                session_id,
                params.data.as_deref().unwrap_or(""),
                params.eof.unwrap_or(false),
            )
            .await
        }
        ProcessAction::Kill => kill(registry, session_id).await,
        ProcessAction::Clear => clear(registry, session_id).await,
        ProcessAction::Remove => remove(registry, session_id).await,
    }
}

async fn list(registry: &Arc<SessionRegistry>) -> Result<ToolResult, SessionError> {
    let mut sessions = registry.list_running().await;
    sessions.extend(registry.list_finished().await);

    let mut overviews: Vec<SessionOverview> = sessions.iter().map(|s| overview(s)).collect();
    overviews.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(a.id.cmp(&b.id)));

    let text = if overviews.is_empty() {
        "(no sessions)".to_string()
    } else {
        overviews
            .iter()
            .map(|o| {
                let exit = match (&o.exit_code, &o.exit_signal) {
                    (Some(code), _) => format!(" exit={code}"),
                    (None, Some(signal)) => format!(" signal={signal}"),
                    (None, None) => String::new(),
                };
                format!("{}  {:<9}  {}{exit}", o.id_prefix, o.status, o.name)
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let mut details = ToolDetails::with_status(SessionStatus::Completed);
    details.sessions = Some(overviews);
    Ok(ToolResult::text(text, details))
}

async fn poll(
    registry: &Arc<SessionRegistry>,
    session_id: &str,
) -> Result<ToolResult, SessionError> {
    let session = registry
        .get_any(session_id)
        .await
        .ok_or_else(|| SessionError::NoSession {
            session_id: session_id.to_string(),
        })?;
    require_backgrounded(&session, "poll")?;

    let (stdout, stderr) = registry.drain(&session);
    let mut text = match (stdout.is_empty(), stderr.is_empty()) {
        (false, false) => format!("{stdout}\n{stderr}"),
        (false, true) => stdout,
        (true, false) => stderr,
        (true, true) => String::new(),
    };
    if text.trim().is_empty() {
        text = "(no new output)".to_string();
    }

    let mut details = detail_for(&session);
    if let Some(record) = session.exit_record() {
        let status_line = match (&record.exit_code, &record.exit_signal) {
            (_, Some(signal)) => format!("Process terminated by signal {signal}"),
            (Some(code), None) => format!("Process exited with code {code}"),
            (None, None) => "Process exited".to_string(),
        };
        text.push('\n');
        text.push_str(&status_line);
    } else {
        details.status = SessionStatus::Running;
    }
    Ok(ToolResult::text(text, details))
}

async fn log(
    registry: &Arc<SessionRegistry>,
    session_id: &str,
    offset: Option<usize>,
    limit: Option<usize>,
) -> Result<ToolResult, SessionError> {
    let session = registry
        .get_any(session_id)
        .await
        .ok_or_else(|| SessionError::NoSession {
            session_id: session_id.to_string(),
        })?;

    let snapshot = session.output_snapshot();
    let lines: Vec<&str> = snapshot.aggregated.lines().collect();
    let total_lines = lines.len();
    let total_chars = snapshot.aggregated.chars().count();

    // No offset + a limit reads the tail; otherwise [offset, offset+limit).
    let slice: &[&str] = match (offset, limit) {
        (None, Some(limit)) => &lines[total_lines.saturating_sub(limit)..],
        (offset, limit) => {
            let start = offset.unwrap_or(0).min(total_lines);
            let end = match limit {
                Some(limit) => start.saturating_add(limit).min(total_lines),
                None => total_lines,
            };
            &lines[start..end]
        }
    };

    let text = if slice.is_empty() {
        "(no output)".to_string()
    } else {
        slice.join("\n")
    };

    let mut details = detail_for(&session);
    details.total_lines = Some(total_lines);
    details.total_chars = Some(total_chars);
    Ok(ToolResult::text(text, details))
}

async fn write(
    registry: &Arc<SessionRegistry>,
    session_id: &str,
    data: &str,
    eof: bool,
) -> Result<ToolResult, SessionError> {
    let session = registry
        .get(session_id)
        .await
        .ok_or_else(|| SessionError::NoActiveSession {
            session_id: session_id.to_string(),
        })?;
    require_backgrounded(&session, "write")?;
    if session.has_exited() {
        return Err(SessionError::state_conflict(format!(
            "session {session_id} has already exited"
        )));
    }

    session.write_stdin(data, eof).await?;

    let mut text = format!(
        "Wrote {} byte(s) to session {}",
        data.len(),
        id_prefix(&session.id)
    );
    if eof {
        text.push_str(" and sent EOF");
    }
    Ok(ToolResult::text(text, detail_for(&session)))
}

async fn kill(
    registry: &Arc<SessionRegistry>,
    session_id: &str,
) -> Result<ToolResult, SessionError> {
    let session = registry
        .get(session_id)
        .await
        .ok_or_else(|| SessionError::NoActiveSession {
            session_id: session_id.to_string(),
        })?;
    require_backgrounded(&session, "kill")?;

    session.set_aborted();
    abort_session(&session).await;
    registry
        .mark_exited(
            &session,
            None,
            Some("SIGKILL".to_string()),
            SessionStatus::Failed,
        )
        .await;

    let text = format!("Killed session {}", id_prefix(&session.id));
    Ok(ToolResult::text(text, detail_for(&session)))
}

async fn clear(
    registry: &Arc<SessionRegistry>,
    session_id: &str,
) -> Result<ToolResult, SessionError> {
    if registry.get_finished(session_id).await.is_none() {
        if registry.get(session_id).await.is_some() {
            return Err(SessionError::state_conflict(format!(
                "session {session_id} is still running; use remove to kill and delete it"
            )));
        }
        return Err(SessionError::NoFinishedSession {
            session_id: session_id.to_string(),
        });
    }

    registry.remove(session_id).await;
    let text = format!("Cleared session {}", id_prefix(session_id));
    Ok(ToolResult::text(
        text,
        ToolDetails::with_status(SessionStatus::Completed),
    ))
}

async fn remove(
    registry: &Arc<SessionRegistry>,
    session_id: &str,
) -> Result<ToolResult, SessionError> {
    let session = registry
        .get_any(session_id)
        .await
        .ok_or_else(|| SessionError::NoSession {
            session_id: session_id.to_string(),
        })?;

    if !session.has_exited() {
        session.set_aborted();
        abort_session(&session).await;
        registry
            .mark_exited(
                &session,
                None,
                Some("SIGKILL".to_string()),
                SessionStatus::Failed,
            )
            .await;
    }
    registry.remove(session_id).await;

    let text = format!("Removed session {}", id_prefix(session_id));
    Ok(ToolResult::text(
        text,
        ToolDetails::with_status(SessionStatus::Completed),
    ))
}

fn require_backgrounded(session: &Session, action: &str) -> Result<(), SessionError> {
    if session.is_backgrounded() {
        return Ok(());
    }
    Err(SessionError::state_conflict(format!(
        "session {} is not backgrounded; {action} applies to backgrounded sessions",
        session.id
    )))
}

fn detail_for(session: &Session) -> ToolDetails {
    let record = session.exit_record();
    let mut details = ToolDetails::with_status(session.status());
    details.session_id = Some(session.id.clone());
    details.pid = session.pid;
    details.exit_code = record.as_ref().and_then(|r| r.exit_code);
    details.exit_signal = record.as_ref().and_then(|r| r.exit_signal.clone());
    details
}

pub(crate) fn id_prefix(id: &str) -> &str {
    id.get(..ID_PREFIX_CHARS).unwrap_or(id)
}

/// Short display name: the command's verb plus its first non-flag argument.
pub(crate) fn derive_display_name(command: &str) -> String {
    let tokens = shlex::split(command)
        .unwrap_or_else(|| command.split_whitespace().map(str::to_string).collect());
    let Some(verb) = tokens.first() else {
        return "(empty)".to_string();
    };
    let target = tokens
        .iter()
        .skip(1)
        .find(|token| !token.starts_with('-'))
        .or_else(|| tokens.get(1));
    match target {
        Some(target) => format!("{verb} {}", truncate_middle(target, NAME_TARGET_MAX_CHARS)),
        None => verb.clone(),
    }
}

fn overview(session: &Arc<Session>) -> SessionOverview {
    let snapshot = session.output_snapshot();
    let record = session.exit_record();
    SessionOverview {
        id: session.id.clone(),
        id_prefix: id_prefix(&session.id).to_string(),
        name: derive_display_name(&session.command),
        command: session.command.clone(),
        status: session.status(),
        pid: session.pid,
        started_at: session.started_at,
        ended_at: record.as_ref().map(|r| r.ended_at),
        cwd: session.cwd.display().to_string(),
        tail: snapshot.tail,
        truncated: snapshot.truncated,
        exit_code: record.as_ref().and_then(|r| r.exit_code),
        exit_signal: record.as_ref().and_then(|r| r.exit_signal.clone()),
        backgrounded: session.is_backgrounded(),
        stdin_mode: session.stdin_mode,
    }
}
