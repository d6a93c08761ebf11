//! Starts a command, wires its stdio into the registry, and runs the race
//! between the yield timer, the overall timeout, external cancellation, and
//! natural exit. Exactly one of those settles the call; output capture and
//! registry updates continue until the OS reports exit.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::OUTPUT_SLICE_CHARS;
use crate::config::SessionConfig;
use crate::config::clamp_yield_ms;
use crate::error::SessionError;
use crate::kill::kill_process_tree;
use crate::registry::SessionRegistry;
use crate::sanitize::sanitize_chunk;
use crate::session::OutputStream;
use crate::session::Session;
use crate::session::SessionStatus;
use crate::session::SessionTransport;
use crate::session::StdinMode;
use crate::shell::resolve_shell;
use crate::tools::BashToolParams;
use crate::tools::SessionUpdate;
use crate::truncate::take_first_chars;
use pi_bash_utils_pty::SpawnedPty;
use pi_bash_utils_pty::backend_status;
use pi_bash_utils_pty::spawn_pty_session;

const READ_CHUNK_BYTES: usize = 8_192;
/// After the OS reports exit, how long the finalizer waits for the reader
/// pumps to flush chunks that were already enqueued.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(250);
const DEFAULT_TERM: &str = "xterm-256color";

/// How a settled `bash` call ended: backgrounded and still running, or
/// finished within the yield window (successfully or not).
pub(crate) enum StartResult {
    Running {
        session: Arc<Session>,
        warning: Option<String>,
    },
    Finished {
        session: Arc<Session>,
        /// Human-readable reason; `None` means success.
        failure: Option<String>,
        warning: Option<String>,
        duration_ms: u64,
    },
}

pub(crate) async fn start_session(
    registry: &Arc<SessionRegistry>,
    params: &BashToolParams,
    config: &SessionConfig,
    cancel: CancellationToken,
    updates: Option<async_channel::Sender<SessionUpdate>>,
) -> Result<StartResult, SessionError> {
    registry.prune_finished().await;

    let command = params.command.trim().to_string();
    if command.is_empty() {
        return Err(SessionError::invalid_arguments("command must not be empty"));
    }

    let cwd = resolve_workdir(params.workdir.as_deref())?;

    let mut env: HashMap<String, String> = std::env::vars().collect();
    if let Some(overlay) = &params.env {
        for (key, value) in overlay {
            env.insert(key.clone(), value.clone());
        }
    }

    let background = params.background.unwrap_or(false);
    let yield_ms = if background {
        0
    } else {
        clamp_yield_ms(params.yield_ms.unwrap_or(config.yield_ms))
    };
    let timeout_secs = params.timeout.unwrap_or(crate::config::DEFAULT_TIMEOUT_SECS);
    let timeout_ms = if timeout_secs > 0 {
        Some(timeout_secs as u64 * 1_000)
    } else {
        None
    };

    let race = RaceParams {
        yield_ms,
        timeout_ms,
        timeout_secs,
        cancel,
    };

    let requested = params.stdin_mode.unwrap_or(StdinMode::Pipe);
    let mut warning = None;

    if requested == StdinMode::Pty {
        env.entry("TERM".to_string())
            .or_insert_with(|| DEFAULT_TERM.to_string());
        match spawn_on_pty(&command, &cwd, &env) {
            Ok(spawned) => {
                return start_pty_session(
                    registry, spawned, command, cwd, config, race, updates, warning,
                )
                .await;
            }
            Err(message) => {
                warning = Some(format!("Warning: {message}; falling back to pipe mode."));
            }
        }
    }

    start_pipe_session(registry, command, cwd, &env, config, race, updates, warning).await
}

struct RaceParams {
    yield_ms: u64,
    timeout_ms: Option<u64>,
    timeout_secs: i64,
    cancel: CancellationToken,
}

fn resolve_workdir(workdir: Option<&std::path::Path>) -> Result<PathBuf, SessionError> {
    let current = std::env::current_dir()
        .map_err(|err| SessionError::invalid_arguments(format!("cannot resolve cwd: {err}")))?;
    let cwd = match workdir {
        Some(dir) if dir.is_absolute() => dir.to_path_buf(),
        Some(dir) => current.join(dir),
        None => current,
    };
    if !cwd.is_dir() {
        return Err(SessionError::invalid_arguments(format!(
            "working directory does not exist: {}",
            cwd.display()
        )));
    }
    Ok(cwd)
}

fn spawn_on_pty(
    command: &str,
    cwd: &std::path::Path,
    env: &HashMap<String, String>,
) -> Result<SpawnedPty, String> {
    backend_status().map_err(|err| err.to_string())?;
    let shell = resolve_shell();
    spawn_pty_session(&shell.program, shell.flag, command, cwd, env)
        .map_err(|err| format!("PTY spawn failed: {err}"))
}

#[allow(clippy::too_many_arguments)]
async fn start_pipe_session(
    registry: &Arc<SessionRegistry>,
    command: String,
    cwd: PathBuf,
    env: &HashMap<String, String>,
    config: &SessionConfig,
    race: RaceParams,
    updates: Option<async_channel::Sender<SessionUpdate>>,
    warning: Option<String>,
) -> Result<StartResult, SessionError> {
    let shell = resolve_shell();
    let mut cmd = tokio::process::Command::new(&shell.program);
    cmd.arg(shell.flag)
        .arg(&command)
        .current_dir(&cwd)
        .env_clear()
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // Own process group, so the tree killer can signal every descendant.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            // The session record exists even when spawn fails; pid stays unset.
            let session = Session::new(
                command,
                cwd,
                StdinMode::Pipe,
                None,
                config.max_output_chars,
                SessionTransport::Pipe {
                    stdin: TokioMutex::new(None),
                },
            );
            registry.add(Arc::clone(&session)).await;
            registry
                .mark_exited(&session, None, None, SessionStatus::Failed)
                .await;
            return Err(SessionError::Spawn {
                shell: shell.program,
                message: err.to_string(),
            });
        }
    };

    let pid = child.id();
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let session = Session::new(
        command,
        cwd,
        StdinMode::Pipe,
        pid,
        config.max_output_chars,
        SessionTransport::Pipe {
            stdin: TokioMutex::new(stdin),
        },
    );
    registry.add(Arc::clone(&session)).await;

    let mut pumps = Vec::new();
    if let Some(stdout) = stdout {
        pumps.push(tokio::spawn(pump_stream(
            stdout,
            OutputStream::Stdout,
            Arc::clone(&session),
            false,
            updates.clone(),
        )));
    }
    if let Some(stderr) = stderr {
        pumps.push(tokio::spawn(pump_stream(
            stderr,
            OutputStream::Stderr,
            Arc::clone(&session),
            false,
            updates.clone(),
        )));
    }

    let (exit_tx, exit_rx) = watch::channel(false);
    tokio::spawn({
        let registry = Arc::clone(registry);
        let session = Arc::clone(&session);
        async move {
            let status = child.wait().await;
            let _ = tokio::time::timeout(EXIT_DRAIN_GRACE, async {
                for pump in pumps {
                    let _ = pump.await;
                }
            })
            .await;
            let (exit_code, exit_signal) = match &status {
                Ok(status) => exit_parts(status),
                Err(_) => (None, None),
            };
            finalize(&registry, &session, exit_code, exit_signal).await;
            let _ = exit_tx.send(true);
        }
    });

    run_settlement_race(registry, session, race, exit_rx, warning).await
}

#[allow(clippy::too_many_arguments)]
async fn start_pty_session(
    registry: &Arc<SessionRegistry>,
    spawned: SpawnedPty,
    command: String,
    cwd: PathBuf,
    config: &SessionConfig,
    race: RaceParams,
    updates: Option<async_channel::Sender<SessionUpdate>>,
    warning: Option<String>,
) -> Result<StartResult, SessionError> {
    let SpawnedPty {
        session: pty,
        mut output_rx,
        exit_rx: pty_exit_rx,
    } = spawned;

    let pid = pty.pid();
    let pty = Arc::new(pty);
    let session = Session::new(
        command,
        cwd,
        StdinMode::Pty,
        pid,
        config.max_output_chars,
        SessionTransport::Pty {
            handle: StdMutex::new(Some(Arc::clone(&pty))),
        },
    );
    registry.add(Arc::clone(&session)).await;

    let pump = tokio::spawn({
        let session = Arc::clone(&session);
        let updates = updates.clone();
        async move {
            let mut carry: Vec<u8> = Vec::new();
            while let Some(chunk) = output_rx.recv().await {
                let text = decode_utf8_stream(&mut carry, &chunk);
                append_chunk(&session, OutputStream::Stdout, &text, true, &updates);
            }
            if !carry.is_empty() {
                let text = String::from_utf8_lossy(&carry).into_owned();
                append_chunk(&session, OutputStream::Stdout, &text, true, &updates);
            }
        }
    });

    let (exit_tx, exit_rx) = watch::channel(false);
    tokio::spawn({
        let registry = Arc::clone(registry);
        let session = Arc::clone(&session);
        async move {
            let code = pty_exit_rx.await.ok();
            let _ = tokio::time::timeout(EXIT_DRAIN_GRACE, pump).await;
            // portable-pty reports an exit code even for signal deaths; a
            // forced kill is surfaced as SIGKILL with the code unset.
            let (exit_code, exit_signal) = if session.aborted() || session.timed_out() {
                (None, Some("SIGKILL".to_string()))
            } else {
                (code, None)
            };
            finalize(&registry, &session, exit_code, exit_signal).await;
            let _ = exit_tx.send(true);
        }
    });

    run_settlement_race(registry, session, race, exit_rx, warning).await
}

/// The first of {yield timer, timeout, cancellation, exit} settles the call.
async fn run_settlement_race(
    registry: &Arc<SessionRegistry>,
    session: Arc<Session>,
    race: RaceParams,
    mut exit_rx: watch::Receiver<bool>,
    warning: Option<String>,
) -> Result<StartResult, SessionError> {
    let started = Instant::now();
    let yield_sleep = sleep(Duration::from_millis(race.yield_ms));
    tokio::pin!(yield_sleep);
    let timeout_sleep = sleep(
        race.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(86_400 * 365)),
    );
    tokio::pin!(timeout_sleep);

    loop {
        tokio::select! {
            biased;

            changed = exit_rx.changed() => {
                if changed.is_err() || *exit_rx.borrow() {
                    return Ok(build_finished(registry, &session, &race, warning, started).await);
                }
            }

            _ = race.cancel.cancelled() => {
                session.set_aborted();
                abort_session(&session).await;
                wait_for_exit(&mut exit_rx).await;
                return Ok(build_finished(registry, &session, &race, warning, started).await);
            }

            _ = &mut timeout_sleep, if race.timeout_ms.is_some() => {
                session.set_timed_out();
                abort_session(&session).await;
                wait_for_exit(&mut exit_rx).await;
                return Ok(build_finished(registry, &session, &race, warning, started).await);
            }

            _ = &mut yield_sleep => {
                registry.mark_backgrounded(&session);
                return Ok(StartResult::Running { session, warning });
            }
        }
    }
}

async fn wait_for_exit(exit_rx: &mut watch::Receiver<bool>) {
    loop {
        if *exit_rx.borrow_and_update() {
            return;
        }
        if exit_rx.changed().await.is_err() {
            return;
        }
    }
}

async fn build_finished(
    registry: &Arc<SessionRegistry>,
    session: &Arc<Session>,
    race: &RaceParams,
    warning: Option<String>,
    started: Instant,
) -> StartResult {
    if session.exit_record().is_none() {
        // The finalizer died without reporting; never leave the call
        // unsettled or the session stuck in the live set.
        registry
            .mark_exited(session, None, None, SessionStatus::Failed)
            .await;
    }
    StartResult::Finished {
        session: Arc::clone(session),
        failure: failure_reason(session, race.timeout_secs),
        warning,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

/// Reason priority: timeout > signal > unknown abort > exit code.
fn failure_reason(session: &Session, timeout_secs: i64) -> Option<String> {
    let record = session.exit_record()?;
    if record.status == SessionStatus::Completed {
        return None;
    }
    if session.timed_out() {
        return Some(format!("Command timed out after {timeout_secs} seconds"));
    }
    if let Some(signal) = &record.exit_signal {
        return Some(format!("Command terminated by signal {signal}"));
    }
    match record.exit_code {
        Some(code) => Some(format!("Command exited with code {code}")),
        None => Some("Command aborted before exit code".to_string()),
    }
}

/// Tree-kill plus, on PTY transports, the backend's own killer.
pub(crate) async fn abort_session(session: &Arc<Session>) {
    if let Some(pid) = session.pid
        && let Err(err) = kill_process_tree(pid).await
    {
        warn!("failed to kill process tree for pid {pid}: {err}");
    }
    session.kill_transport();
}

async fn finalize(
    registry: &Arc<SessionRegistry>,
    session: &Arc<Session>,
    exit_code: Option<i32>,
    exit_signal: Option<String>,
) {
    let status = if session.aborted()
        || session.timed_out()
        || exit_signal.is_some()
        || exit_code != Some(0)
    {
        SessionStatus::Failed
    } else {
        SessionStatus::Completed
    };
    registry
        .mark_exited(session, exit_code, exit_signal, status)
        .await;
}

fn exit_parts(status: &std::process::ExitStatus) -> (Option<i32>, Option<String>) {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return (None, Some(signal_name(signal)));
        }
    }
    (status.code(), None)
}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    match signal {
        libc::SIGHUP => "SIGHUP".to_string(),
        libc::SIGINT => "SIGINT".to_string(),
        libc::SIGQUIT => "SIGQUIT".to_string(),
        libc::SIGABRT => "SIGABRT".to_string(),
        libc::SIGKILL => "SIGKILL".to_string(),
        libc::SIGSEGV => "SIGSEGV".to_string(),
        libc::SIGPIPE => "SIGPIPE".to_string(),
        libc::SIGTERM => "SIGTERM".to_string(),
        other => format!("SIG{other}"),
    }
}

async fn pump_stream(
    mut reader: impl AsyncRead + Unpin,
    stream: OutputStream,
    session: Arc<Session>,
    keep_ansi: bool,
    updates: Option<async_channel::Sender<SessionUpdate>>,
) {
    let mut buf = [0u8; READ_CHUNK_BYTES];
    let mut carry: Vec<u8> = Vec::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = decode_utf8_stream(&mut carry, &buf[..n]);
                append_chunk(&session, stream, &text, keep_ansi, &updates);
            }
            Err(_) => break,
        }
    }
    if !carry.is_empty() {
        let text = String::from_utf8_lossy(&carry).into_owned();
        append_chunk(&session, stream, &text, keep_ansi, &updates);
    }
}

/// Sanitize, slice, append under the cap, and emit one progress update per
/// appended slice.
fn append_chunk(
    session: &Arc<Session>,
    stream: OutputStream,
    text: &str,
    keep_ansi: bool,
    updates: &Option<async_channel::Sender<SessionUpdate>>,
) {
    if text.is_empty() {
        return;
    }
    let sanitized = sanitize_chunk(text, keep_ansi);
    let mut rest = sanitized.as_str();
    while !rest.is_empty() {
        let slice = take_first_chars(rest, OUTPUT_SLICE_CHARS);
        let appended = session.append_slice(stream, slice);
        rest = &rest[slice.len()..];
        if appended && let Some(updates) = updates {
            let _ = updates.try_send(SessionUpdate {
                session_id: session.id.clone(),
                status: SessionStatus::Running,
                tail: session.tail(),
            });
        }
    }
}

/// Incremental UTF-8 decoding across chunk boundaries: an incomplete
/// trailing sequence is carried into the next read; invalid bytes become
/// replacement characters.
fn decode_utf8_stream(carry: &mut Vec<u8>, chunk: &[u8]) -> String {
    carry.extend_from_slice(chunk);
    let mut out = String::with_capacity(carry.len());
    loop {
        match std::str::from_utf8(carry) {
            Ok(valid) => {
                out.push_str(valid);
                carry.clear();
                return out;
            }
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&carry[..valid_up_to]));
                match err.error_len() {
                    Some(invalid_len) => {
                        out.push('\u{fffd}');
                        carry.drain(..valid_up_to + invalid_len);
                    }
                    None => {
                        carry.drain(..valid_up_to);
                        return out;
                    }
                }
            }
        }
    }
}
