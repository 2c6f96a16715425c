//! Command channels: how commands reach a SUT once it is reachable.
//!
//! - `ShellChannel` runs commands on the local host
//! - `SerialChannel` runs commands over a virtual machine's serial console

mod serial;
mod shell;

pub use serial::SerialChannel;
pub use shell::ShellChannel;

use crate::error::{Result, SutError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Working directory and environment a command runs with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandEnv {
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl CommandEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Set one environment variable.
    pub fn var(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.cwd.is_none() && self.env.is_empty()
    }

    /// `cd <cwd> && export K=V && ` prefix for shells reached over a console.
    pub fn shell_prefix(&self) -> String {
        let mut prefix = String::new();
        if let Some(cwd) = &self.cwd {
            prefix.push_str(&format!("cd {} && ", cwd.display()));
        }
        for (key, value) in &self.env {
            prefix.push_str(&format!("export {key}={value} && "));
        }
        prefix
    }
}

/// Result of running one command through a channel.
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutput {
    pub command: String,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Exit code (0 = success).
    pub returncode: i32,
    pub stdout: String,
    /// Wall-clock execution time in seconds.
    pub exec_time: f64,
    /// Timeout the command ran under, in seconds.
    pub timeout: f64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.returncode == 0
    }
}

/// Trait for executing commands on a SUT.
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Whether a command (or transfer) is in progress.
    fn is_running(&self) -> bool;

    fn start(&self) -> Result<()>;

    /// Run `command` from `env.cwd` with `env.env` exported, reporting
    /// output lines to `on_line` as they arrive.
    fn run_cmd_with(
        &self,
        command: &str,
        env: &CommandEnv,
        timeout: Duration,
        on_line: Option<&dyn Fn(&str)>,
    ) -> Result<CommandOutput>;

    fn run_cmd(
        &self,
        command: &str,
        timeout: Duration,
        on_line: Option<&dyn Fn(&str)>,
    ) -> Result<CommandOutput> {
        self.run_cmd_with(command, &CommandEnv::default(), timeout, on_line)
    }

    /// Run a command that's expected to succeed and return its output.
    fn run_cmd_ok(&self, command: &str, timeout: Duration) -> Result<String> {
        let out = self.run_cmd(command, timeout, None)?;
        if !out.success() {
            return Err(SutError::backend(format!(
                "Command failed (exit {}): {}\nOutput: {}",
                out.returncode, command, out.stdout
            )));
        }
        Ok(out.stdout)
    }

    /// Stop the running command, waiting at most `timeout` for it to end.
    fn stop(&self, timeout: Duration) -> Result<()>;

    fn force_stop(&self, timeout: Duration) -> Result<()>;
}

/// Poll `is_running` until it turns false or `timeout` elapses.
pub(crate) fn wait_for_idle(is_running: impl Fn() -> bool, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    while is_running() {
        if start.elapsed() > timeout {
            return Err(SutError::timeout("Stop", timeout));
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}

/// Unique token used to find the end of a command's output.
pub(crate) fn exit_marker() -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let micros = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}x{:x}", micros, seq)
}
