//! Command execution on the local host.

use super::{wait_for_idle, Channel, CommandEnv, CommandOutput};
use crate::error::{Result, SutError};
use crate::process::{exit_code, shell_command, signal_group, signal_running};
use crate::reader::{PollReader, ReadStatus};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Runs commands through `sh -c` on the host, one at a time.
#[derive(Default)]
pub struct ShellChannel {
    cwd: Option<PathBuf>,
    child: Mutex<Option<Child>>,
    reader: Mutex<Option<Arc<PollReader<ChildStdout>>>>,
    running: AtomicBool,
}

impl ShellChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run commands from `cwd` instead of the current directory.
    pub fn with_cwd(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: Some(cwd.into()),
            ..Self::default()
        }
    }

    fn spawn(&self, command: &str, env: &CommandEnv) -> Result<(Child, Arc<PollReader<ChildStdout>>)> {
        let mut cmd = shell_command(&format!("exec 2>&1; {command}"));
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).envs(&env.env);
        if let Some(cwd) = env.cwd.as_ref().or(self.cwd.as_ref()) {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SutError::backend("Failed to get process stdout"))?;
        let reader = match PollReader::new(stdout) {
            Ok(reader) => Arc::new(reader),
            Err(err) => {
                let _ = signal_group(&child, libc::SIGKILL);
                let _ = child.wait();
                return Err(err.into());
            }
        };
        Ok((child, reader))
    }

    /// Start `command` and mark the channel busy in one step, so a
    /// concurrent `stop()` always finds the child to signal.
    fn launch(&self, command: &str, env: &CommandEnv) -> Result<Arc<PollReader<ChildStdout>>> {
        let mut slot = self.child.lock();
        if self.running.load(Ordering::SeqCst) {
            return Err(SutError::backend("A command is already running"));
        }

        let (child, reader) = self.spawn(command, env)?;
        *slot = Some(child);
        *self.reader.lock() = Some(reader.clone());
        self.running.store(true, Ordering::SeqCst);
        Ok(reader)
    }

    fn execute(
        &self,
        command: &str,
        env: &CommandEnv,
        reader: &PollReader<ChildStdout>,
        timeout: Duration,
        on_line: Option<&dyn Fn(&str)>,
    ) -> Result<CommandOutput> {
        let start = Instant::now();

        let log_line = |line: &str| {
            info!("{line}");
            if let Some(callback) = on_line {
                callback(line);
            }
        };
        let out = reader.read_until(|_| false, start, timeout, Some(&log_line))?;

        let mut child = self
            .child
            .lock()
            .take()
            .ok_or_else(|| SutError::backend("Process handle lost"))?;

        if out.status == ReadStatus::TimedOut {
            info!("Command timed out after {:?}", timeout);
            signal_group(&child, libc::SIGKILL)?;
            child.wait()?;
            return Err(SutError::timeout(format!("'{command}' command"), timeout));
        }

        let status = child.wait()?;
        let ret = CommandOutput {
            command: command.to_string(),
            cwd: env.cwd.clone(),
            env: env.env.clone(),
            returncode: exit_code(status),
            stdout: out.buffer,
            exec_time: start.elapsed().as_secs_f64(),
            timeout: timeout.as_secs_f64(),
        };
        debug!("return data={:?}", ret);
        Ok(ret)
    }

    fn signal(&self, signal: libc::c_int) -> Result<()> {
        if let Some(child) = self.child.lock().as_mut() {
            signal_running(child, signal)?;
        }
        Ok(())
    }
}

impl Channel for ShellChannel {
    fn name(&self) -> &str {
        "shell"
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn run_cmd_with(
        &self,
        command: &str,
        env: &CommandEnv,
        timeout: Duration,
        on_line: Option<&dyn Fn(&str)>,
    ) -> Result<CommandOutput> {
        if command.is_empty() {
            return Err(SutError::invalid("command is empty"));
        }

        info!("Executing command (timeout={:?}): {}", timeout, command);

        let reader = self.launch(command, env)?;
        let result = self.execute(command, env, &reader, timeout, on_line);

        *self.reader.lock() = None;
        self.running.store(false, Ordering::SeqCst);

        if result.is_ok() {
            info!("Command executed");
        }
        result
    }

    fn stop(&self, timeout: Duration) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        info!("Terminating process");
        self.signal(libc::SIGTERM)?;
        wait_for_idle(|| self.is_running(), timeout)
    }

    fn force_stop(&self, timeout: Duration) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        info!("Killing process");
        self.signal(libc::SIGKILL)?;
        // a background child may still hold the pipe open
        if let Some(reader) = self.reader.lock().as_ref() {
            reader.stop();
        }
        wait_for_idle(|| self.is_running(), timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_run_cmd_captures_output_and_code() {
        let channel = ShellChannel::new();
        let out = channel
            .run_cmd("echo hello; echo oops >&2; exit 4", Duration::from_secs(10), None)
            .unwrap();
        assert_eq!(out.returncode, 4);
        assert_eq!(out.stdout, "hello\noops\n");
        assert!(!channel.is_running());
    }

    #[test]
    fn test_run_cmd_reports_lines() {
        let channel = ShellChannel::new();
        let lines = Mutex::new(Vec::new());
        let collect = |line: &str| lines.lock().push(line.to_string());

        channel
            .run_cmd("printf 'a  \\nb\\n'", Duration::from_secs(10), Some(&collect))
            .unwrap();
        assert_eq!(*lines.lock(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_empty_command_rejected() {
        let err = ShellChannel::new()
            .run_cmd("", Duration::from_secs(1), None)
            .unwrap_err();
        assert!(matches!(err, SutError::InvalidArgument(_)));
    }

    #[test]
    fn test_timeout_kills_command() {
        let channel = ShellChannel::new();
        let start = Instant::now();
        let err = channel
            .run_cmd("sleep 30", Duration::from_millis(200), None)
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(!channel.is_running());
    }

    #[test]
    fn test_stop_terminates_running_command() {
        let channel = Arc::new(ShellChannel::new());

        let worker = {
            let channel = channel.clone();
            thread::spawn(move || channel.run_cmd("sleep 30", Duration::from_secs(60), None))
        };

        let start = Instant::now();
        while !channel.is_running() && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(10));
        }
        thread::sleep(Duration::from_millis(100));

        channel.stop(Duration::from_secs(5)).unwrap();
        let out = worker.join().unwrap().unwrap();
        assert_eq!(out.returncode, 128 + libc::SIGTERM);
    }

    #[test]
    fn test_stop_as_soon_as_command_is_busy() {
        let channel = Arc::new(ShellChannel::new());

        let worker = {
            let channel = channel.clone();
            thread::spawn(move || channel.run_cmd("sleep 30", Duration::from_secs(60), None))
        };

        let start = Instant::now();
        while !channel.is_running() && start.elapsed() < Duration::from_secs(5) {
            std::hint::spin_loop();
        }

        channel.stop(Duration::from_secs(5)).unwrap();
        let out = worker.join().unwrap().unwrap();
        assert_eq!(out.returncode, 128 + libc::SIGTERM);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_run_cmd_with_cwd_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let channel = ShellChannel::new();
        let env = CommandEnv::new().cwd(dir.path()).var("SUT_GREETING", "hi there");

        let out = channel
            .run_cmd_with("pwd -P; echo \"$SUT_GREETING\"", &env, Duration::from_secs(10), None)
            .unwrap();

        let cwd = dir.path().canonicalize().unwrap();
        assert_eq!(out.stdout, format!("{}\nhi there\n", cwd.display()));
        assert_eq!(out.cwd.as_deref(), Some(dir.path()));
        assert_eq!(out.env.get("SUT_GREETING").map(String::as_str), Some("hi there"));
    }

    #[test]
    fn test_channel_cwd_is_the_default() {
        let dir = tempfile::tempdir().unwrap();
        let channel = ShellChannel::with_cwd(dir.path());

        let out = channel.run_cmd("pwd -P", Duration::from_secs(10), None).unwrap();
        let cwd = dir.path().canonicalize().unwrap();
        assert_eq!(out.stdout.trim_end(), cwd.display().to_string());
    }
}
