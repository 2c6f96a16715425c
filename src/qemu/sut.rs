//! QEMU virtual machine backend.

use super::command::{build_piped, command_line, qemu_params, SessionFiles};
use super::config::QemuConfig;
use super::dialogue::{image_locked, LoginStep};
use crate::channel::{Channel, SerialChannel};
use crate::downloader::{Downloader, TransportDownloader};
use crate::error::{Result, SutError};
use crate::locate::{ExecutableLocator, SearchPath};
use crate::process::{exit_code, signal_group, signal_running, wait_with_timeout};
use crate::reader::{PollReader, ReadStatus};
use crate::sut::Sut;
use parking_lot::Mutex;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Bound for each shell setup command issued after login.
const SETUP_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a closed console waits for the emulator exit code.
const EXIT_GRACE: Duration = Duration::from_secs(1);

/// Running emulator and its console.
struct VmProcess {
    child: Child,
    stdin: Arc<Mutex<ChildStdin>>,
    reader: Arc<PollReader<ChildStdout>>,
    files: SessionFiles,
}

/// A virtual machine booted from a disk image and driven over its serial console.
pub struct QemuSut {
    config: QemuConfig,
    locator: Arc<dyn ExecutableLocator>,
    process: Mutex<Option<VmProcess>>,
    channel: Mutex<Option<Arc<SerialChannel>>>,
    downloader: Mutex<Option<Arc<TransportDownloader>>>,
    /// Set under the console lock, shared with the serial channel.
    stop_requested: Arc<AtomicBool>,
    logged_in: AtomicBool,
    /// Serializes `stop()` and `force_stop()`.
    stop_lock: Mutex<()>,
}

impl QemuSut {
    /// Backend that finds the emulator on `PATH`.
    pub fn new(config: QemuConfig) -> Self {
        Self::with_locator(config, Arc::new(SearchPath))
    }

    pub fn with_locator(config: QemuConfig, locator: Arc<dyn ExecutableLocator>) -> Self {
        Self {
            config,
            locator,
            process: Mutex::new(None),
            channel: Mutex::new(None),
            downloader: Mutex::new(None),
            stop_requested: Arc::new(AtomicBool::new(false)),
            logged_in: AtomicBool::new(false),
            stop_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &QemuConfig {
        &self.config
    }

    /// Whether the login dialogue completed for the current process.
    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    /// Console log of the current process, if one is running.
    pub fn tty_log(&self) -> Option<PathBuf> {
        self.process.lock().as_ref().map(|vm| vm.files.tty_log.clone())
    }

    fn stopping(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Mark the session as stopping.
    ///
    /// The flag is raised while holding the console, so anything typed into
    /// it either completed before the stop or checks the flag and backs off.
    fn request_stop(&self) {
        let stdin = self.process.lock().as_ref().map(|vm| vm.stdin.clone());
        let _console = stdin.as_ref().map(|stdin| stdin.lock());
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    fn console(&self) -> Result<(Arc<Mutex<ChildStdin>>, Arc<PollReader<ChildStdout>>)> {
        self.process
            .lock()
            .as_ref()
            .map(|vm| (vm.stdin.clone(), vm.reader.clone()))
            .ok_or_else(|| SutError::backend("Virtual machine is not running"))
    }

    fn spawn(&self) -> Result<VmProcess> {
        let emulator = self.config.emulator();
        let exe = self
            .locator
            .locate(&emulator)
            .ok_or_else(|| SutError::CommandNotFound(emulator.clone()))?;

        let image = match self.config.image_overlay() {
            Some(overlay) => {
                info!(
                    "Creating image copy {} -> {}",
                    self.config.image().display(),
                    overlay.display()
                );
                std::fs::copy(self.config.image(), overlay)?;
                overlay.to_path_buf()
            }
            None => self.config.image().to_path_buf(),
        };

        let files = SessionFiles::new(self.config.tmpdir());
        let params = qemu_params(&self.config, &image, &files);
        let line = command_line(&exe, &params);

        info!("Starting virtual machine");
        debug!("{line}");

        let mut child = build_piped(&line).spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SutError::backend("Failed to get qemu stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SutError::backend("Failed to get qemu stdout"))?;

        let reader = match PollReader::new(stdout) {
            Ok(reader) => Arc::new(reader),
            Err(err) => {
                let _ = signal_group(&child, libc::SIGKILL);
                let _ = child.wait();
                return Err(err.into());
            }
        };

        Ok(VmProcess {
            child,
            stdin: Arc::new(Mutex::new(stdin)),
            reader,
            files,
        })
    }

    /// Fail if the emulator already exited with a non-zero code.
    ///
    /// A closed console gives the process a short grace period to report
    /// its exit code. Exits during a stop are expected.
    fn check_exit(&self, status: ReadStatus) -> Result<()> {
        let mut process = self.process.lock();
        if self.stopping() {
            return Ok(());
        }
        let Some(vm) = process.as_mut() else {
            return Ok(());
        };

        let exited = if status == ReadStatus::Closed {
            wait_with_timeout(&mut vm.child, EXIT_GRACE)?
        } else {
            vm.child.try_wait()?
        };

        match exited.map(exit_code) {
            Some(code) if code != 0 => Err(SutError::ProcessExited {
                what: "Qemu session".to_string(),
                code,
            }),
            _ => Ok(()),
        }
    }

    /// Run one login step. Returns false when a stop cut it short.
    fn wait_and_send(&self, step: LoginStep, on_line: Option<&dyn Fn(&str)>) -> Result<bool> {
        if self.stopping() {
            return Ok(false);
        }

        let (stdin, reader) = self.console()?;
        info!("Waiting for {}", step.description());

        let log_line = |line: &str| {
            info!("{line}");
            if let Some(callback) = on_line {
                callback(line);
            }
        };

        let out = match reader.read_until(
            |buffer| step.matches(buffer),
            Instant::now(),
            step.timeout(&self.config),
            Some(&log_line),
        ) {
            Ok(out) => out,
            Err(_) if self.stopping() => return Ok(false),
            Err(err) => return Err(err.into()),
        };

        if self.stopping() {
            return Ok(false);
        }

        match self.check_exit(out.status) {
            Ok(()) => {}
            Err(_) if self.stopping() => return Ok(false),
            Err(err) => return Err(err),
        }

        if self.stopping() {
            return Ok(false);
        }

        match out.status {
            ReadStatus::Matched if image_locked(&out.buffer) => {
                return Err(SutError::backend("Qemu image is locked by another process"));
            }
            ReadStatus::Matched => {}
            ReadStatus::TimedOut => return Err(SutError::backend(step.missing_message())),
            ReadStatus::Stopped => return Ok(false),
            ReadStatus::Closed => {
                return Err(SutError::backend(format!(
                    "Qemu session closed while waiting for {}",
                    step.description()
                )));
            }
        }

        let mut stdin = stdin.lock();
        if self.stopping() {
            return Ok(false);
        }

        let reply = format!("{}\n", step.reply(&self.config));
        match stdin.write_all(reply.as_bytes()).and_then(|_| stdin.flush()) {
            Ok(()) => Ok(true),
            Err(_) if self.stopping() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Run a post-login command unless a stop arrived meanwhile.
    fn setup_cmd(&self, channel: &SerialChannel, command: &str) -> Result<()> {
        if self.stopping() {
            return Ok(());
        }

        let out = match channel.run_cmd(command, SETUP_TIMEOUT, None) {
            Ok(out) => out,
            Err(_) if self.stopping() => return Ok(()),
            Err(err) => return Err(err),
        };
        if self.stopping() {
            debug!("Stop requested during '{command}'");
            return Ok(());
        }
        if !out.success() {
            return Err(SutError::backend(format!(
                "'{}' failed with exit code {}: {}",
                command, out.returncode, out.stdout
            )));
        }
        Ok(())
    }

    /// Attach the serial channel to the logged in console.
    fn attach_channel(&self) -> Result<Option<Arc<SerialChannel>>> {
        let (stdin, reader) = self.console()?;
        let transport_file = self
            .process
            .lock()
            .as_ref()
            .map(|vm| vm.files.transport_file.clone())
            .ok_or_else(|| SutError::backend("Virtual machine is not running"))?;

        let channel = Arc::new(
            SerialChannel::new(stdin, reader, self.config.transport_dev(), transport_file)?
                .halt_on(self.stop_requested.clone()),
        );
        channel.start()?;

        let mut slot = self.channel.lock();
        if self.stopping() {
            return Ok(None);
        }
        *slot = Some(channel.clone());
        *self.downloader.lock() = Some(Arc::new(TransportDownloader::new(channel.clone())));

        Ok(Some(channel))
    }

    fn stop_reader(&self) {
        if let Some(vm) = self.process.lock().as_ref() {
            vm.reader.stop();
        }
    }

    /// Wait for the emulator to exit and drop its handle.
    fn wait_exit(&self, timeout: Duration) -> Result<()> {
        let mut process = self.process.lock();
        let Some(vm) = process.as_mut() else {
            return Ok(());
        };

        match wait_with_timeout(&mut vm.child, timeout)? {
            Some(status) => {
                debug!("qemu exited with code {}", exit_code(status));
                *process = None;
                info!("Virtual machine stopped");
                Ok(())
            }
            None => Err(SutError::timeout("Virtual machine poweroff", timeout)),
        }
    }
}

impl Sut for QemuSut {
    fn name(&self) -> &str {
        "qemu"
    }

    fn communicate(&self, on_line: Option<&dyn Fn(&str)>) -> Result<()> {
        {
            // held until the new process is owned, so a concurrent call
            // can never start a second emulator
            let mut process = self.process.lock();
            if process.is_some() || self.channel.lock().is_some() {
                return Err(SutError::AlreadyRunning("Virtual machine".to_string()));
            }

            self.stop_requested.store(false, Ordering::SeqCst);
            self.logged_in.store(false, Ordering::SeqCst);

            *process = Some(self.spawn()?);
        }

        for step in LoginStep::SEQUENCE {
            if !self.wait_and_send(step, on_line)? {
                return Ok(());
            }
        }

        self.logged_in.store(true, Ordering::SeqCst);

        if self.stopping() {
            return Ok(());
        }

        let Some(channel) = self.attach_channel()? else {
            return Ok(());
        };

        self.setup_cmd(&channel, "export PS1=''")?;

        if self.config.virtfs().is_some() {
            self.setup_cmd(&channel, "mount -t 9p -o trans=virtio host0 /mnt")?;
        }

        if !self.stopping() {
            info!("Virtual machine started");
        }
        Ok(())
    }

    fn stop(&self, timeout: Duration) -> Result<()> {
        let _guard = self.stop_lock.lock();
        info!("Shutting down virtual machine");
        self.request_stop();

        self.stop_reader();

        let channel = self.channel.lock().take();
        *self.downloader.lock() = None;
        if let Some(channel) = channel {
            channel.stop(timeout)?;
        }

        if let Some(vm) = self.process.lock().as_mut() {
            if self.is_logged_in() {
                info!("Sending poweroff");
                let mut stdin = vm.stdin.lock();
                let sent = stdin
                    .write_all(b"poweroff\n")
                    .and_then(|_| stdin.flush());
                match sent {
                    Ok(()) => {}
                    // the machine may be gone before the flush
                    Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                        debug!("poweroff: {e}");
                    }
                    Err(e) => return Err(e.into()),
                }
            } else {
                info!("Terminating virtual machine");
                signal_running(&mut vm.child, libc::SIGTERM)?;
            }
        }

        self.wait_exit(timeout)
    }

    fn force_stop(&self, timeout: Duration) -> Result<()> {
        let _guard = self.stop_lock.lock();
        info!("Killing virtual machine");
        self.request_stop();

        self.stop_reader();

        if let Some(vm) = self.process.lock().as_mut() {
            signal_running(&mut vm.child, libc::SIGKILL)?;
        }

        let channel = self.channel.lock().take();
        *self.downloader.lock() = None;
        if let Some(channel) = channel {
            channel.force_stop(timeout)?;
        }

        self.wait_exit(timeout)
    }

    fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.channel
            .lock()
            .clone()
            .map(|channel| channel as Arc<dyn Channel>)
    }

    fn downloader(&self) -> Option<Arc<dyn Downloader>> {
        self.downloader
            .lock()
            .clone()
            .map(|downloader| downloader as Arc<dyn Downloader>)
    }
}

impl Drop for QemuSut {
    fn drop(&mut self) {
        if let Some(mut vm) = self.process.get_mut().take() {
            warn!("Virtual machine still running, killing it");
            vm.reader.stop();
            let _ = signal_running(&mut vm.child, libc::SIGKILL);
            let _ = vm.child.wait();
        }
    }
}
