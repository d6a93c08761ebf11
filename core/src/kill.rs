//! Best-effort process-tree termination.

use std::io;

#[cfg(unix)]
use std::time::Duration;

/// Grace between the polite signal and the forced one.
#[cfg(unix)]
const ESCALATION_DELAY: Duration = Duration::from_millis(150);

/// Terminate a process together with everything it spawned.
///
/// Both transports make the child a process-group leader at spawn time
/// (`setpgid(0, 0)` for pipes, `setsid` inside portable-pty), so a single
/// group signal reaches the whole tree without enumerating descendants. On
/// Unix this escalates SIGTERM to SIGKILL after a short grace; on Windows it
/// delegates to `taskkill /T /F`. A tree that is already gone counts as
/// success.
pub async fn kill_process_tree(pid: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        use pi_bash_utils_pty::process_group;
        use pi_bash_utils_pty::process_group::GroupSignal;

        if process_group::signal(pid, libc::SIGTERM)? == GroupSignal::AlreadyGone {
            return Ok(());
        }
        tokio::time::sleep(ESCALATION_DELAY).await;
        process_group::signal(pid, libc::SIGKILL).map(|_| ())
    }

    #[cfg(windows)]
    {
        let output = tokio::process::Command::new("taskkill")
            .args(["/T", "/F", "/PID", &pid.to_string()])
            .output()
            .await?;
        match output.status.code() {
            // 128: nothing left under that pid to kill.
            Some(0) | Some(128) => Ok(()),
            code => Err(io::Error::other(format!(
                "taskkill on pid {pid} exited with {code:?}"
            ))),
        }
    }
}
