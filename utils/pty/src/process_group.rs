//! Group-wide signal delivery, shared by the PTY teardown path and the
//! pipe-transport tree killer.

use std::io;

/// What delivering a group signal found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSignal {
    Delivered,
    AlreadyGone,
}

/// Deliver `signal` to the process group led by `pid`.
///
/// Every child this service spawns is made a group leader up front (`setsid`
/// inside portable-pty, `setpgid(0, 0)` for pipe transports), so the group
/// id equals the child's pid and no lookup is needed. A group that has
/// already vanished is reported as [`GroupSignal::AlreadyGone`], not as an
/// error.
pub fn signal(pid: u32, signal: libc::c_int) -> io::Result<GroupSignal> {
    if pid == 0 {
        // kill(2) with pid 0 addresses the caller's own group.
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "refusing to signal process group 0",
        ));
    }
    if unsafe { libc::kill(-(pid as libc::pid_t), signal) } == 0 {
        return Ok(GroupSignal::Delivered);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(GroupSignal::AlreadyGone)
    } else {
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_zero_is_rejected() {
        let err = match signal(0, libc::SIGTERM) {
            Err(err) => err,
            Ok(outcome) => panic!("pid 0 must be rejected, got {outcome:?}"),
        };
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn vanished_groups_are_not_errors() {
        let mut child = match std::process::Command::new("true").spawn() {
            Ok(child) => child,
            Err(err) => panic!("failed to spawn: {err}"),
        };
        let pid = child.id();
        let _ = child.wait();
        // The group never existed (the child stayed in ours), so the signal
        // finds nothing.
        assert!(matches!(
            signal(pid, libc::SIGTERM),
            Ok(GroupSignal::AlreadyGone)
        ));
    }
}
