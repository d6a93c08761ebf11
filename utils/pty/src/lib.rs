//! Pseudo-terminal transport for shell sessions.
//!
//! Wraps `portable-pty` behind a small API: a one-time availability probe
//! whose outcome (success or failure) is cached for the life of the process,
//! and a spawn helper that produces a [`PtySession`] wired to tokio channels.

use std::collections::HashMap;
use std::io;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::OnceLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Result;
use portable_pty::CommandBuilder;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::trace;

#[cfg(unix)]
pub mod process_group;

/// Fixed initial geometry. No resize operation is exposed.
pub const PTY_COLS: u16 = 120;
pub const PTY_ROWS: u16 = 30;

const READ_BUF_BYTES: usize = 8_192;
/// Pause before retrying a read that failed with EINTR or EAGAIN.
const READ_RETRY_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Error)]
#[error("PTY backend unavailable: {message}")]
pub struct PtyBackendError {
    message: String,
}

impl PtyBackendError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

static BACKEND_PROBE: OnceLock<Result<(), PtyBackendError>> = OnceLock::new();
static BACKEND_OVERRIDE: StdMutex<Option<Result<(), PtyBackendError>>> = StdMutex::new(None);

/// Whether the native PTY backend can be used at all.
///
/// The first call opens (and immediately closes) a throwaway PTY pair; the
/// outcome is cached, so a failing backend is reported without re-probing on
/// every spawn.
pub fn backend_status() -> Result<(), PtyBackendError> {
    if let Ok(guard) = BACKEND_OVERRIDE.lock()
        && let Some(forced) = guard.as_ref()
    {
        return forced.clone();
    }
    BACKEND_PROBE.get_or_init(probe_backend).clone()
}

fn probe_backend() -> Result<(), PtyBackendError> {
    let pty_system = native_pty_system();
    match pty_system.openpty(PtySize {
        rows: 1,
        cols: 1,
        pixel_width: 0,
        pixel_height: 0,
    }) {
        Ok(pair) => {
            drop(pair);
            Ok(())
        }
        Err(err) => Err(PtyBackendError::new(err.to_string())),
    }
}

/// Force [`backend_status`] to report the given outcome, bypassing the probe.
/// `None` restores normal probing.
#[doc(hidden)]
pub fn override_backend_status_for_tests(forced: Option<Result<(), String>>) {
    if let Ok(mut guard) = BACKEND_OVERRIDE.lock() {
        *guard = forced.map(|r| r.map_err(PtyBackendError::new));
    }
}

/// Exit bookkeeping shared between the wait task and the session handle.
#[derive(Debug)]
struct ChildState {
    exited: AtomicBool,
    exit_code: StdMutex<Option<i32>>,
    pid: StdMutex<Option<u32>>,
}

impl ChildState {
    fn new(pid: Option<u32>) -> Self {
        Self {
            exited: AtomicBool::new(false),
            exit_code: StdMutex::new(None),
            pid: StdMutex::new(pid),
        }
    }

    fn record_exit(&self, code: i32) {
        if let Ok(mut guard) = self.exit_code.lock() {
            *guard = Some(code);
        }
        // The pid is retired before the exited flag flips, so no teardown
        // path can signal a recycled id.
        if let Ok(mut guard) = self.pid.lock() {
            guard.take();
        }
        self.exited.store(true, Ordering::SeqCst);
    }

    fn pid(&self) -> Option<u32> {
        self.pid.lock().ok().and_then(|guard| *guard)
    }

    fn take_pid(&self) -> Option<u32> {
        self.pid.lock().ok().and_then(|mut guard| guard.take())
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_code.lock().ok().and_then(|guard| *guard)
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

/// A live PTY-backed shell process.
///
/// Output arrives on the `output_rx` channel of [`SpawnedPty`]; input goes
/// through [`PtySession::writer_sender`]. Stdout and stderr share the single
/// merged PTY stream. Dropping the session kills the child's process group
/// and tears down the pump tasks.
#[derive(Debug)]
pub struct PtySession {
    writer_tx: mpsc::Sender<Vec<u8>>,
    killer: StdMutex<Option<Box<dyn portable_pty::ChildKiller + Send + Sync>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    state: Arc<ChildState>,
}

impl PtySession {
    pub fn writer_sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.writer_tx.clone()
    }

    pub fn has_exited(&self) -> bool {
        self.state.has_exited()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.state.exit_code()
    }

    pub fn pid(&self) -> Option<u32> {
        self.state.pid()
    }

    /// Force-kill the child and its process group. Tolerates an
    /// already-dead child.
    pub fn kill(&self) -> io::Result<()> {
        self.signal_teardown(false)
    }

    /// Group signal first, then the backend's own killer. `retire_pid`
    /// consumes the pid so the final teardown cannot fire twice.
    fn signal_teardown(&self, retire_pid: bool) -> io::Result<()> {
        #[cfg(unix)]
        {
            let pid = if retire_pid {
                self.state.take_pid()
            } else {
                self.state.pid()
            };
            if let Some(pid) = pid {
                process_group::signal(pid, libc::SIGKILL)?;
            }
        }

        if let Ok(mut guard) = self.killer.lock()
            && let Some(killer) = guard.as_mut()
        {
            match killer.kill() {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        if let Err(err) = self.signal_teardown(true) {
            trace!("PTY teardown failed: {err}");
        }
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

#[derive(Debug)]
pub struct SpawnedPty {
    pub session: PtySession,
    pub output_rx: mpsc::Receiver<Vec<u8>>,
    pub exit_rx: oneshot::Receiver<i32>,
}

/// Spawn `program flag command` on a fresh PTY with the fixed geometry.
///
/// The returned channels carry raw merged output and the final exit code.
/// The environment is replaced wholesale with `env`; callers pass the fully
/// merged map.
pub fn spawn_pty_session(
    program: &str,
    flag: &str,
    command: &str,
    cwd: &Path,
    env: &HashMap<String, String>,
) -> Result<SpawnedPty> {
    if program.is_empty() {
        anyhow::bail!("missing program for PTY spawn");
    }

    let pty_system = native_pty_system();
    let pair = pty_system.openpty(PtySize {
        rows: PTY_ROWS,
        cols: PTY_COLS,
        pixel_width: 0,
        pixel_height: 0,
    })?;

    let mut command_builder = CommandBuilder::new(program);
    command_builder.arg(flag);
    command_builder.arg(command);
    command_builder.cwd(cwd);
    command_builder.env_clear();
    for (key, value) in env {
        command_builder.env(key, value);
    }

    let mut child = pair.slave.spawn_command(command_builder)?;
    let killer = child.clone_killer();
    let state = Arc::new(ChildState::new(child.process_id()));

    let (writer_tx, writer_rx) = mpsc::channel::<Vec<u8>>(128);
    let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(256);

    let reader = pair.master.try_clone_reader()?;
    let reader_task = tokio::task::spawn_blocking(move || forward_pty_output(reader, output_tx));

    let writer = pair.master.take_writer()?;
    let writer_task = tokio::task::spawn_blocking(move || drain_stdin_queue(writer, writer_rx));

    let (exit_tx, exit_rx) = oneshot::channel::<i32>();
    let wait_state = Arc::clone(&state);
    let wait_task = tokio::task::spawn_blocking(move || {
        let code = child
            .wait()
            .map(|status| status.exit_code() as i32)
            .unwrap_or(-1);
        wait_state.record_exit(code);
        let _ = exit_tx.send(code);
    });

    let session = PtySession {
        writer_tx,
        killer: StdMutex::new(Some(killer)),
        tasks: StdMutex::new(vec![reader_task, writer_task, wait_task]),
        state,
    };

    Ok(SpawnedPty {
        session,
        output_rx,
        exit_rx,
    })
}

/// Blocking read loop on the PTY master. EINTR and EAGAIN both get a brief
/// pause before retrying; EOF, a hard error, or a closed channel ends the
/// pump.
fn forward_pty_output(mut reader: Box<dyn Read + Send>, output_tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; READ_BUF_BYTES];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(n) => n,
            Err(err) if retryable_read_error(&err) => {
                std::thread::sleep(READ_RETRY_DELAY);
                continue;
            }
            Err(_) => 0,
        };
        if n == 0 || output_tx.blocking_send(buf[..n].to_vec()).is_err() {
            break;
        }
    }
}

fn retryable_read_error(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock)
}

/// Blocking write loop feeding the PTY master; the queue closing or a write
/// failure ends it.
fn drain_stdin_queue(mut writer: Box<dyn Write + Send>, mut writer_rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = writer_rx.blocking_recv() {
        if writer
            .write_all(&bytes)
            .and_then(|()| writer.flush())
            .is_err()
        {
            break;
        }
    }
}
