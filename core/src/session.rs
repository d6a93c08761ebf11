//! The per-invocation lifecycle record: one shell command, its transport,
//! its captured output, and its terminal state.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::Mutex as TokioMutex;
use tracing::trace;
use uuid::Uuid;

use crate::config::TAIL_MAX_CHARS;
use crate::error::SessionError;
use crate::truncate::take_first_chars;
use crate::truncate::take_last_chars;
use pi_bash_utils_pty::PtySession;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Stdio transport a session was actually spawned with (a PTY request can
/// fall back to `Pipe`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdinMode {
    Pipe,
    Pty,
}

impl std::fmt::Display for StdinMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StdinMode::Pipe => write!(f, "pipe"),
            StdinMode::Pty => write!(f, "pty"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// The stdin side of the session, discriminated by the transport that was
/// actually used. Handles are cleared on removal.
pub(crate) enum SessionTransport {
    Pipe {
        stdin: TokioMutex<Option<ChildStdin>>,
    },
    Pty {
        handle: StdMutex<Option<Arc<PtySession>>>,
    },
}

#[derive(Debug, Default)]
struct OutputState {
    aggregated: String,
    aggregated_chars: usize,
    tail: String,
    pending_stdout: String,
    pending_stderr: String,
    total_chars: u64,
    truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitRecord {
    pub ended_at: u64,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<String>,
    pub status: SessionStatus,
}

#[derive(Debug, Clone)]
pub struct OutputSnapshot {
    pub aggregated: String,
    pub tail: String,
    pub total_output_chars: u64,
    pub truncated: bool,
}

pub struct Session {
    pub id: String,
    pub command: String,
    pub cwd: PathBuf,
    pub stdin_mode: StdinMode,
    pub pid: Option<u32>,
    pub started_at: u64,
    pub max_output_chars: usize,
    backgrounded: AtomicBool,
    exited: AtomicBool,
    timed_out: AtomicBool,
    aborted: AtomicBool,
    output: StdMutex<OutputState>,
    exit: StdMutex<Option<ExitRecord>>,
    transport: SessionTransport,
}

impl Session {
    pub(crate) fn new(
        command: String,
        cwd: PathBuf,
        stdin_mode: StdinMode,
        pid: Option<u32>,
        max_output_chars: usize,
        transport: SessionTransport,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            command,
            cwd,
            stdin_mode,
            pid,
            started_at: now_ms(),
            max_output_chars,
            backgrounded: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            output: StdMutex::new(OutputState::default()),
            exit: StdMutex::new(None),
            transport,
        })
    }

    /// Append one sanitized slice (at most `OUTPUT_SLICE_CHARS` characters).
    ///
    /// Returns true when at least one character was appended; once the cap
    /// is reached the remainder is dropped and `truncated` latches. Appends
    /// after exit are dropped entirely.
    pub(crate) fn append_slice(&self, stream: OutputStream, slice: &str) -> bool {
        if slice.is_empty() || self.has_exited() {
            return false;
        }
        let Ok(mut out) = self.output.lock() else {
            return false;
        };

        let slice_chars = slice.chars().count();
        out.total_chars += slice_chars as u64;

        let remaining = self.max_output_chars.saturating_sub(out.aggregated_chars);
        let take = remaining.min(slice_chars);
        if take < slice_chars {
            out.truncated = true;
        }
        if take == 0 {
            return false;
        }

        let kept = take_first_chars(slice, take);
        out.aggregated.push_str(kept);
        out.aggregated_chars += take;

        out.tail.push_str(kept);
        if out.tail.chars().count() > TAIL_MAX_CHARS {
            out.tail = take_last_chars(&out.tail, TAIL_MAX_CHARS).to_string();
        }

        match stream {
            OutputStream::Stdout => out.pending_stdout.push_str(kept),
            OutputStream::Stderr => out.pending_stderr.push_str(kept),
        }
        true
    }

    /// Atomically take the pending stdout/stderr buffers. A chunk is
    /// observed either entirely before or entirely after the swap; drained
    /// bytes are never re-emitted.
    pub(crate) fn drain_pending(&self) -> (String, String) {
        match self.output.lock() {
            Ok(mut out) => (
                std::mem::take(&mut out.pending_stdout),
                std::mem::take(&mut out.pending_stderr),
            ),
            Err(_) => (String::new(), String::new()),
        }
    }

    /// Cheap preview accessor; avoids cloning `aggregated`.
    pub fn tail(&self) -> String {
        self.output
            .lock()
            .map(|out| out.tail.clone())
            .unwrap_or_default()
    }

    pub fn output_snapshot(&self) -> OutputSnapshot {
        match self.output.lock() {
            Ok(out) => OutputSnapshot {
                aggregated: out.aggregated.clone(),
                tail: out.tail.clone(),
                total_output_chars: out.total_chars,
                truncated: out.truncated,
            },
            Err(_) => OutputSnapshot {
                aggregated: String::new(),
                tail: String::new(),
                total_output_chars: 0,
                truncated: false,
            },
        }
    }

    /// False → true exactly once; later calls are no-ops.
    pub(crate) fn mark_backgrounded(&self) -> bool {
        !self.backgrounded.swap(true, Ordering::SeqCst)
    }

    pub fn is_backgrounded(&self) -> bool {
        self.backgrounded.load(Ordering::SeqCst)
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    pub(crate) fn set_timed_out(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
    }

    pub(crate) fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    pub(crate) fn set_aborted(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Record terminal state. The first call stamps `ended_at`; subsequent
    /// calls update the status fields only. Returns true on the first call
    /// (the caller moves the session from live to finished exactly once).
    pub(crate) fn set_exit_record(
        &self,
        exit_code: Option<i32>,
        exit_signal: Option<String>,
        status: SessionStatus,
    ) -> bool {
        let first = !self.exited.swap(true, Ordering::SeqCst);
        if let Ok(mut record) = self.exit.lock() {
            match record.as_mut() {
                Some(existing) => {
                    existing.exit_code = exit_code;
                    existing.exit_signal = exit_signal;
                    existing.status = status;
                }
                None => {
                    *record = Some(ExitRecord {
                        ended_at: now_ms(),
                        exit_code,
                        exit_signal,
                        status,
                    });
                }
            }
        }
        first
    }

    pub fn exit_record(&self) -> Option<ExitRecord> {
        self.exit.lock().ok().and_then(|guard| guard.clone())
    }

    pub fn status(&self) -> SessionStatus {
        if !self.has_exited() {
            return SessionStatus::Running;
        }
        self.exit_record()
            .map(|record| record.status)
            .unwrap_or(SessionStatus::Failed)
    }

    /// Write to the session's stdin. `eof` closes the pipe, or sends Ctrl-D
    /// on a PTY.
    pub(crate) async fn write_stdin(&self, data: &str, eof: bool) -> Result<(), SessionError> {
        match &self.transport {
            SessionTransport::Pipe { stdin } => {
                let mut guard = stdin.lock().await;
                let Some(writer) = guard.as_mut() else {
                    return Err(SessionError::state_conflict(format!(
                        "stdin for session {} is closed",
                        self.id
                    )));
                };
                if !data.is_empty() {
                    writer
                        .write_all(data.as_bytes())
                        .await
                        .map_err(|err| SessionError::Stdin(err.to_string()))?;
                    writer
                        .flush()
                        .await
                        .map_err(|err| SessionError::Stdin(err.to_string()))?;
                }
                if eof {
                    guard.take();
                }
                Ok(())
            }
            SessionTransport::Pty { handle } => {
                let writer_tx = match handle.lock() {
                    Ok(guard) => guard.as_ref().map(|session| session.writer_sender()),
                    Err(_) => None,
                };
                let Some(writer_tx) = writer_tx else {
                    return Err(SessionError::state_conflict(format!(
                        "stdin for session {} is closed",
                        self.id
                    )));
                };
                if !data.is_empty() {
                    writer_tx
                        .send(data.as_bytes().to_vec())
                        .await
                        .map_err(|err| SessionError::Stdin(err.to_string()))?;
                }
                if eof {
                    writer_tx
                        .send(vec![0x04])
                        .await
                        .map_err(|err| SessionError::Stdin(err.to_string()))?;
                }
                Ok(())
            }
        }
    }

    /// Transport-level force kill; the PTY backend keeps its own killer in
    /// addition to the process-tree signal.
    pub(crate) fn kill_transport(&self) {
        if let SessionTransport::Pty { handle } = &self.transport
            && let Ok(guard) = handle.lock()
            && let Some(session) = guard.as_ref()
            && let Err(err) = session.kill()
        {
            trace!("PTY kill for session {} failed: {err}", self.id);
        }
    }

    /// Drop any retained OS handles. Called on removal and by the sweeper.
    pub(crate) async fn clear_transport(&self) {
        match &self.transport {
            SessionTransport::Pipe { stdin } => {
                stdin.lock().await.take();
            }
            SessionTransport::Pty { handle } => {
                if let Ok(mut guard) = handle.lock() {
                    guard.take();
                }
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("stdin_mode", &self.stdin_mode)
            .field("pid", &self.pid)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
