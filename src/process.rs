//! Process helpers shared by the emulator backend and the shell channel.
//!
//! Every child is spawned as the leader of its own process group so that a
//! signal reaches both the `sh -c` wrapper and whatever it started.

use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus};
use std::time::{Duration, Instant};

/// Interval between liveness checks while waiting for a child to exit.
pub const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Build a `sh -c <line>` command that leads a new process group.
pub fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(line).process_group(0);
    cmd
}

/// Send `signal` to the child's process group.
///
/// A group that no longer exists is not an error.
pub fn signal_group(child: &Child, signal: libc::c_int) -> io::Result<()> {
    let pgid = child.id() as libc::pid_t;
    let ret = unsafe { libc::kill(-pgid, signal) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

/// Signal the child's process group unless the child already exited.
///
/// Once a child has been reaped its process group ID may be reused, so an
/// exited child is never signalled. Returns whether a signal was sent.
pub fn signal_running(child: &mut Child, signal: libc::c_int) -> io::Result<bool> {
    if child.try_wait()?.is_some() {
        return Ok(false);
    }
    signal_group(child, signal)?;
    Ok(true)
}

/// Poll `child` until it exits or `timeout` elapses.
///
/// Returns `Ok(None)` when the child is still alive after `timeout`.
pub fn wait_with_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if start.elapsed() > timeout {
            return Ok(None);
        }
        std::thread::sleep(EXIT_POLL_INTERVAL);
    }
}

/// Exit code of a finished process; signal deaths map to `128 + signo`.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_of_normal_exit() {
        let mut child = shell_command("exit 3").spawn().unwrap();
        let status = wait_with_timeout(&mut child, Duration::from_secs(5))
            .unwrap()
            .expect("child should exit");
        assert_eq!(exit_code(status), 3);
    }

    #[test]
    fn test_signal_group_terminates_child() {
        let mut child = shell_command("sleep 30").spawn().unwrap();
        signal_group(&child, libc::SIGTERM).unwrap();

        let status = wait_with_timeout(&mut child, Duration::from_secs(5))
            .unwrap()
            .expect("child should exit");
        assert_eq!(exit_code(status), 128 + libc::SIGTERM);
    }

    #[test]
    fn test_signal_running_skips_reaped_child() {
        let mut child = shell_command("exit 0").spawn().unwrap();
        wait_with_timeout(&mut child, Duration::from_secs(5))
            .unwrap()
            .expect("child should exit");

        assert!(!signal_running(&mut child, libc::SIGKILL).unwrap());

        let mut live = shell_command("sleep 30").spawn().unwrap();
        assert!(signal_running(&mut live, libc::SIGKILL).unwrap());
        let status = wait_with_timeout(&mut live, Duration::from_secs(5))
            .unwrap()
            .expect("child should exit");
        assert_eq!(exit_code(status), 128 + libc::SIGKILL);
    }

    #[test]
    fn test_wait_times_out_on_live_child() {
        let mut child = shell_command("sleep 30").spawn().unwrap();
        let status = wait_with_timeout(&mut child, Duration::from_millis(100)).unwrap();
        assert!(status.is_none());

        signal_group(&child, libc::SIGKILL).unwrap();
        let _ = child.wait();
    }
}
