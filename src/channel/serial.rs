//! Command execution over a virtual machine's serial console.
//!
//! This is not a general serial protocol: commands are typed into the
//! console shell and each one is followed by `echo $?-<marker>`, so the
//! exit code line tells us where the command's output ends. File transfers
//! go through a second serial device whose host side is a plain file.

use super::{exit_marker, wait_for_idle, Channel, CommandEnv, CommandOutput};
use crate::error::{Result, SutError};
use crate::reader::{PollReader, ReadStatus};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{ChildStdin, ChildStdout};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Return code reported for a command interrupted by `stop()`.
const STOPPED_RETURNCODE: i32 = libc::SIGTERM;

pub struct SerialChannel {
    stdin: Arc<Mutex<ChildStdin>>,
    reader: Arc<PollReader<ChildStdout>>,
    transport_dev: String,
    transport_path: PathBuf,
    started: AtomicBool,
    running: AtomicBool,
    stop: AtomicBool,
    /// Owner-wide stop request; once set nothing more is typed.
    halt: Option<Arc<AtomicBool>>,
    cmd_lock: Mutex<()>,
    /// Bytes of the transport file already consumed.
    last_pos: Mutex<u64>,
}

impl SerialChannel {
    /// Bind to a console (`stdin`/`reader`) and a transport device.
    ///
    /// `transport_dev` is the device path inside the guest,
    /// `transport_path` the file backing it on the host.
    pub fn new(
        stdin: Arc<Mutex<ChildStdin>>,
        reader: Arc<PollReader<ChildStdout>>,
        transport_dev: impl Into<String>,
        transport_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let transport_dev = transport_dev.into();
        if transport_dev.is_empty() {
            return Err(SutError::invalid("transport device is empty"));
        }

        Ok(Self {
            stdin,
            reader,
            transport_dev,
            transport_path: transport_path.into(),
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            halt: None,
            cmd_lock: Mutex::new(()),
            last_pos: Mutex::new(0),
        })
    }

    /// Refuse to type anything once `flag` is set.
    ///
    /// `flag` must be set while holding the console lock, so a command is
    /// either fully typed before the stop or never typed at all.
    pub fn halt_on(mut self, flag: Arc<AtomicBool>) -> Self {
        self.halt = Some(flag);
        self
    }

    pub fn transport_dev(&self) -> &str {
        &self.transport_dev
    }

    /// Ask the current command or transfer to end without waiting for it.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn halted(&self) -> bool {
        self.halt
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    fn write(&self, data: &str) -> io::Result<()> {
        let mut stdin = self.stdin.lock();
        stdin.write_all(data.as_bytes())?;
        stdin.flush()
    }

    /// Type `data` unless the owner halted the console. Returns whether it was sent.
    fn write_unless_halted(&self, data: &str) -> io::Result<bool> {
        let mut stdin = self.stdin.lock();
        if self.halted() {
            return Ok(false);
        }
        stdin.write_all(data.as_bytes())?;
        stdin.flush()?;
        Ok(true)
    }

    fn send_ctrl_c(&self) -> io::Result<()> {
        info!("Sending CTRL+C");
        self.write("\x03\n")
    }

    /// Type `command` into the console and collect its output.
    fn send(
        &self,
        command: &str,
        timeout: Duration,
        on_line: Option<&dyn Fn(&str)>,
    ) -> Result<(i32, String)> {
        let marker = exit_marker();
        let cmd_end = format!("echo $?-{marker}");

        if !self.write_unless_halted(&format!("{command}\n{cmd_end}\n"))? {
            debug!("Console halted, '{command}' not sent");
            return Ok((STOPPED_RETURNCODE, String::new()));
        }

        let start = Instant::now();
        let mut stdout = String::new();

        loop {
            let out = self
                .reader
                .read_until(|b| b.ends_with('\n'), start, timeout, None)?;

            match out.status {
                ReadStatus::Matched => {}
                ReadStatus::TimedOut => {
                    self.send_ctrl_c()?;
                    return Err(SutError::timeout(format!("'{command}' command"), timeout));
                }
                ReadStatus::Stopped => return Ok((STOPPED_RETURNCODE, stdout)),
                ReadStatus::Closed => {
                    return Err(SutError::backend(format!(
                        "Console closed while running '{command}'"
                    )))
                }
            }

            if self.stopping() {
                return Ok((STOPPED_RETURNCODE, stdout));
            }

            let line = out.buffer;
            let trimmed = line.trim_end();

            // console echo of what we typed
            if trimmed.ends_with(command.trim()) || trimmed.ends_with(&cmd_end) {
                continue;
            }

            if let Some(code) = parse_exit_line(trimmed, &marker) {
                debug!("retcode={}", code);
                return Ok((code, stdout));
            }

            debug!("{trimmed}");
            if let Some(callback) = on_line {
                callback(trimmed);
            }
            stdout.push_str(&line);
        }
    }

    /// Download `target_path` from the guest into `local_path`.
    pub fn fetch_file(&self, target_path: &Path, local_path: &Path, timeout: Duration) -> Result<()> {
        if target_path.as_os_str().is_empty() {
            return Err(SutError::invalid("target path is empty"));
        }
        if local_path.as_os_str().is_empty() {
            return Err(SutError::invalid("local path is empty"));
        }

        info!(
            "Downloading: {} -> {}",
            target_path.display(),
            local_path.display()
        );

        let ret = self.run_cmd(
            &format!("cat {} > {}", target_path.display(), self.transport_dev),
            timeout,
            None,
        )?;

        if ret.returncode == STOPPED_RETURNCODE {
            return Ok(());
        }

        if ret.returncode != 0 {
            return Err(SutError::backend(format!(
                "Can't send file to {}: {}",
                self.transport_dev, ret.stdout
            )));
        }

        self.running.store(true, Ordering::SeqCst);
        let result = self.copy_transport(target_path, local_path, timeout);
        self.running.store(false, Ordering::SeqCst);
        self.stop.store(false, Ordering::SeqCst);

        if result.is_ok() {
            info!("File downloaded");
        }
        result
    }

    /// Copy what the guest wrote to the transport file since the last fetch.
    fn copy_transport(&self, target_path: &Path, local_path: &Path, timeout: Duration) -> Result<()> {
        let file_size = std::fs::metadata(&self.transport_path)?.len();
        let start = Instant::now();

        let mut transport = File::open(&self.transport_path)?;
        let mut local = File::create(local_path)?;
        let mut last_pos = self.last_pos.lock();
        let mut data = [0u8; 4096];

        while !self.stopping() && *last_pos < file_size {
            if start.elapsed() >= timeout {
                info!("Transfer timed out after {:?}", timeout);
                return Err(SutError::timeout(
                    format!(
                        "Transfer {} -> {}",
                        target_path.display(),
                        local_path.display()
                    ),
                    timeout,
                ));
            }

            std::thread::sleep(Duration::from_millis(50));

            transport.seek(SeekFrom::Start(*last_pos))?;
            let len = (file_size - *last_pos).min(data.len() as u64) as usize;
            let n = transport.read(&mut data[..len])?;
            *last_pos += n as u64;

            local.write_all(&data[..n])?;
        }

        Ok(())
    }
}

impl Channel for SerialChannel {
    fn name(&self) -> &str {
        "serial"
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn start(&self) -> Result<()> {
        info!("Serial channel ready (transport {})", self.transport_dev);
        self.started.store(true, Ordering::SeqCst);
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
        if !self.started.load(Ordering::SeqCst) {
            return Err(SutError::backend("Serial channel is not started"));
        }

        let _guard = self.cmd_lock.lock();
        info!("Running command: {}", command);

        let start = Instant::now();
        self.running.store(true, Ordering::SeqCst);
        let typed = format!("{}{}", env.shell_prefix(), command);
        let result = self.send(&typed, timeout, on_line);
        self.running.store(false, Ordering::SeqCst);
        self.stop.store(false, Ordering::SeqCst);

        let (returncode, stdout) = result?;
        let ret = CommandOutput {
            command: command.to_string(),
            cwd: env.cwd.clone(),
            env: env.env.clone(),
            returncode,
            stdout,
            exec_time: start.elapsed().as_secs_f64(),
            timeout: timeout.as_secs_f64(),
        };
        debug!("{:?}", ret);
        info!("Command completed");
        Ok(ret)
    }

    fn stop(&self, timeout: Duration) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        info!("Stopping command");
        self.request_stop();
        // a broken console means the command is gone anyway
        if let Err(err) = self.send_ctrl_c() {
            debug!("CTRL+C not delivered: {err}");
        }
        wait_for_idle(|| self.is_running(), timeout)?;
        info!("Command stopped");
        Ok(())
    }

    fn force_stop(&self, timeout: Duration) -> Result<()> {
        self.stop(timeout)
    }
}

/// Parse `<code>-<marker>` into the exit code.
fn parse_exit_line(line: &str, marker: &str) -> Option<i32> {
    let code = line.trim().strip_suffix(marker)?.strip_suffix('-')?;
    if code.is_empty() || !code.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    code.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exit_line() {
        assert_eq!(parse_exit_line("0-abc", "abc"), Some(0));
        assert_eq!(parse_exit_line("  127-abc\r", "abc"), Some(127));
        assert_eq!(parse_exit_line("echo $?-abc", "abc"), None);
        assert_eq!(parse_exit_line("-abc", "abc"), None);
        assert_eq!(parse_exit_line("0-abd", "abc"), None);
    }
}
