//! The agent-facing surface: the `bash` and `process` tools.
//!
//! Parameters arrive as loose JSON blobs at the agent boundary and are
//! validated into typed records here; every outcome, including invalid
//! input, is reported as a structured [`ToolResult`] rather than an error.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::controller;
use crate::executor;
use crate::executor::StartResult;
use crate::registry::SessionRegistry;
use crate::session::SessionStatus;
use crate::session::StdinMode;

/// Parameters accepted by the `bash` tool.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BashToolParams {
    pub command: String,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
    #[serde(default)]
    pub yield_ms: Option<u64>,
    #[serde(default)]
    pub background: Option<bool>,
    /// Seconds; non-positive disables the overall timeout.
    #[serde(default)]
    pub timeout: Option<i64>,
    #[serde(default)]
    pub stdin_mode: Option<StdinMode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessAction {
    List,
    Poll,
    Log,
    Write,
    Kill,
    Clear,
    Remove,
}

impl std::fmt::Display for ProcessAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProcessAction::List => "list",
            ProcessAction::Poll => "poll",
            ProcessAction::Log => "log",
            ProcessAction::Write => "write",
            ProcessAction::Kill => "kill",
            ProcessAction::Clear => "clear",
            ProcessAction::Remove => "remove",
        };
        write!(f, "{name}")
    }
}

/// Parameters accepted by the `process` tool.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessToolParams {
    pub action: ProcessAction,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub eof: Option<bool>,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text { text: String },
}

/// One entry of the `list` action.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOverview {
    pub id: String,
    pub id_prefix: String,
    pub name: String,
    pub command: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
    pub cwd: String,
    pub tail: String,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_signal: Option<String>,
    pub backgrounded: bool,
    pub stdin_mode: StdinMode,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDetails {
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_signal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdin_mode: Option<StdinMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_lines: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_chars: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions: Option<Vec<SessionOverview>>,
}

impl ToolDetails {
    pub(crate) fn with_status(status: SessionStatus) -> Self {
        Self {
            status,
            session_id: None,
            pid: None,
            exit_code: None,
            exit_signal: None,
            duration_ms: None,
            truncated: None,
            stdin_mode: None,
            total_lines: None,
            total_chars: None,
            sessions: None,
        }
    }
}

/// Result shape shared by both tools:
/// `{ content: [{type: "text", text}], details: {status, …} }`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub content: Vec<ContentBlock>,
    pub details: ToolDetails,
}

impl ToolResult {
    pub(crate) fn text(text: impl Into<String>, details: ToolDetails) -> Self {
        Self {
            content: vec![ContentBlock::Text { text: text.into() }],
            details,
        }
    }

    pub(crate) fn failure(message: impl Into<String>) -> Self {
        Self::text(message, ToolDetails::with_status(SessionStatus::Failed))
    }

    /// All text blocks joined; convenient for assertions and rendering.
    pub fn text_joined(&self) -> String {
        self.content
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => text.as_str(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Progress event emitted while a session produces output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdate {
    pub session_id: String,
    pub status: SessionStatus,
    pub tail: String,
}

/// Both tools, bound to one registry instance.
///
/// The registry is intentionally shared, process-wide state; constructing
/// the tools owns a fresh one, so tests get isolation for free and the
/// embedding runtime keeps a single instance for its lifetime.
pub struct SessionTools {
    registry: Arc<SessionRegistry>,
    config: SessionConfig,
}

impl SessionTools {
    pub fn new(config: SessionConfig) -> Self {
        let registry = SessionRegistry::new(config.job_ttl_ms);
        Self { registry, config }
    }

    /// Defaults plus `PI_BASH_YIELD_MS` / `PI_BASH_MAX_OUTPUT_CHARS`.
    pub fn from_env() -> Self {
        Self::new(SessionConfig::from_env())
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The `bash` tool: start a command, wait up to the yield window, and
    /// either return its outcome or background it.
    pub async fn bash(
        &self,
        params: serde_json::Value,
        cancel: CancellationToken,
        updates: Option<async_channel::Sender<SessionUpdate>>,
    ) -> ToolResult {
        let params: BashToolParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(err) => return ToolResult::failure(format!("invalid bash parameters: {err}")),
        };
        self.bash_typed(params, cancel, updates).await
    }

    pub async fn bash_typed(
        &self,
        params: BashToolParams,
        cancel: CancellationToken,
        updates: Option<async_channel::Sender<SessionUpdate>>,
    ) -> ToolResult {
        match executor::start_session(&self.registry, &params, &self.config, cancel, updates).await
        {
            Ok(result) => format_start_result(result),
            Err(err) => ToolResult::failure(err.to_string()),
        }
    }

    /// The `process` tool: follow-up actions on an existing session.
    pub async fn process(&self, params: serde_json::Value) -> ToolResult {
        let params: ProcessToolParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(err) => return ToolResult::failure(format!("invalid process parameters: {err}")),
        };
        self.process_typed(params).await
    }

    pub async fn process_typed(&self, params: ProcessToolParams) -> ToolResult {
        match controller::handle_process(&self.registry, &params).await {
            Ok(result) => result,
            Err(err) => ToolResult::failure(err.to_string()),
        }
    }
}

fn format_start_result(result: StartResult) -> ToolResult {
    match result {
        StartResult::Running { session, warning } => {
            let mut text = String::new();
            if let Some(warning) = warning {
                text.push_str(&warning);
                text.push('\n');
            }
            text.push_str(&format!(
                "Command still running; backgrounded as session {}.\nUse the process tool to poll, write to stdin, or kill it.",
                session.id
            ));
            let tail = session.tail();
            if !tail.trim().is_empty() {
                text.push_str("\nOutput so far:\n");
                text.push_str(&tail);
            }

            let mut details = ToolDetails::with_status(SessionStatus::Running);
            details.session_id = Some(session.id.clone());
            details.pid = session.pid;
            details.stdin_mode = Some(session.stdin_mode);
            ToolResult::text(text, details)
        }
        StartResult::Finished {
            session,
            failure,
            warning,
            duration_ms,
        } => {
            let snapshot = session.output_snapshot();
            let record = session.exit_record();
            let output = snapshot.aggregated.trim();
            let body = if output.is_empty() {
                "(no output)"
            } else {
                output
            };

            let mut text = String::new();
            if let Some(warning) = warning {
                text.push_str(&warning);
                text.push('\n');
            }
            text.push_str(body);
            if let Some(reason) = &failure {
                text.push('\n');
                text.push_str(reason);
            }

            let status = if failure.is_none() {
                SessionStatus::Completed
            } else {
                SessionStatus::Failed
            };
            let mut details = ToolDetails::with_status(status);
            details.session_id = Some(session.id.clone());
            details.pid = session.pid;
            details.exit_code = record.as_ref().and_then(|r| r.exit_code);
            details.exit_signal = record.as_ref().and_then(|r| r.exit_signal.clone());
            details.duration_ms = Some(duration_ms);
            details.truncated = Some(snapshot.truncated);
            details.stdin_mode = Some(session.stdin_mode);
            ToolResult::text(text, details)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn rejects_malformed_bash_parameters() {
        let tools = SessionTools::new(SessionConfig::default());
        let result = tools
            .bash(json!({"command": 42}), CancellationToken::new(), None)
            .await;
        assert_eq!(result.details.status, SessionStatus::Failed);
        assert!(result.text_joined().contains("invalid bash parameters"));
    }

    #[tokio::test]
    async fn rejects_unknown_process_action() {
        let tools = SessionTools::new(SessionConfig::default());
        let result = tools.process(json!({"action": "pause"})).await;
        assert_eq!(result.details.status, SessionStatus::Failed);
        assert!(result.text_joined().contains("invalid process parameters"));
    }

    #[tokio::test]
    async fn requires_session_id_for_non_list_actions() {
        let tools = SessionTools::new(SessionConfig::default());
        let result = tools.process(json!({"action": "poll"})).await;
        assert_eq!(result.details.status, SessionStatus::Failed);
        assert!(result.text_joined().contains("sessionId is required"));
    }

    #[tokio::test]
    async fn empty_command_is_a_structured_failure() {
        let tools = SessionTools::new(SessionConfig::default());
        let result = tools
            .bash(json!({"command": "   "}), CancellationToken::new(), None)
            .await;
        assert_eq!(result.details.status, SessionStatus::Failed);
        assert!(result.text_joined().contains("command must not be empty"));
    }

    #[tokio::test]
    async fn list_on_a_fresh_registry_is_empty() {
        let tools = SessionTools::new(SessionConfig::default());
        let result = tools.process(json!({"action": "list"})).await;
        assert_eq!(result.details.status, SessionStatus::Completed);
        assert_eq!(result.text_joined(), "(no sessions)");
    }

    #[test]
    fn tool_result_serializes_with_camel_case_details() {
        let mut details = ToolDetails::with_status(SessionStatus::Completed);
        details.session_id = Some("abc".to_string());
        details.exit_code = Some(0);
        let result = ToolResult::text("hi", details);
        let value = match serde_json::to_value(&result) {
            Ok(value) => value,
            Err(err) => panic!("serialization failed: {err}"),
        };
        assert_eq!(value["content"][0]["type"], "text");
        assert_eq!(value["content"][0]["text"], "hi");
        assert_eq!(value["details"]["status"], "completed");
        assert_eq!(value["details"]["sessionId"], "abc");
        assert_eq!(value["details"]["exitCode"], 0);
    }
}
