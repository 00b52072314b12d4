//! Process-group cleanup for timed-out scripts.
//!
//! Scripts are spawned as leaders of their own process group, so killing
//! the group also takes down anything they started.

use std::io;

use tokio::process::Child;

/// Kill the process group led by `child` with SIGKILL (best-effort).
#[cfg(unix)]
pub fn kill_child_process_group(child: &Child) -> io::Result<()> {
    let Some(pid) = child.id() else {
        // Already reaped.
        return Ok(());
    };

    let result = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if result == -1 {
        let err = io::Error::last_os_error();
        // ESRCH: the group is already gone.
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }

    Ok(())
}

/// No-op on non-Unix platforms; the caller still kills the child itself.
#[cfg(not(unix))]
pub fn kill_child_process_group(_child: &Child) -> io::Result<()> {
    Ok(())
}
