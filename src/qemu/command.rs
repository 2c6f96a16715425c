//! Emulator command line.

use super::config::{QemuConfig, SerialKind};
use crate::process::shell_command;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Host-side files a virtual machine session writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFiles {
    /// Copy of everything the guest console printed.
    pub tty_log: PathBuf,
    /// Backing file of the guest transport device.
    pub transport_file: PathBuf,
}

impl SessionFiles {
    /// Files for the current process inside `tmpdir`.
    pub fn new(tmpdir: &Path) -> Self {
        let pid = std::process::id();
        Self {
            tty_log: tmpdir.join(format!("ttyS0-{pid}.log")),
            transport_file: tmpdir.join(format!("transport-{pid}")),
        }
    }
}

/// Emulator parameters for booting `image` with `config`.
pub fn qemu_params(config: &QemuConfig, image: &Path, files: &SessionFiles) -> Vec<String> {
    let mut params = vec![
        "-enable-kvm".to_string(),
        "-display none".to_string(),
        format!("-m {}", config.ram()),
        format!("-smp {}", config.smp()),
        "-device virtio-rng-pci".to_string(),
        format!("-drive if=virtio,cache=unsafe,file={}", image.display()),
        format!("-chardev stdio,id=tty,logfile={}", files.tty_log.display()),
    ];

    match config.serial() {
        SerialKind::Isa => {
            params.push("-serial chardev:tty".to_string());
            params.push("-serial chardev:transport".to_string());
        }
        SerialKind::Virtio => {
            params.push("-device virtio-serial".to_string());
            params.push("-device virtconsole,chardev=tty".to_string());
            params.push("-device virtserialport,chardev=transport".to_string());
        }
    }

    params.push(format!(
        "-chardev file,id=transport,path={}",
        files.transport_file.display()
    ));

    if let Some(ro_image) = config.ro_image() {
        params.push(format!(
            "-drive if=virtio,cache=unsafe,readonly=on,file={}",
            ro_image.display()
        ));
    }

    if let Some(virtfs) = config.virtfs() {
        params.push(format!(
            "-virtfs local,path={},mount_tag=host0,security_model=mapped-xattr,readonly=on",
            virtfs.display()
        ));
    }

    params.extend(config.options().iter().cloned());
    params
}

/// Shell line that replaces the shell with the emulator, stderr merged into stdout.
pub fn command_line(exe: &Path, params: &[String]) -> String {
    format!("exec {} {} 2>&1", exe.display(), params.join(" "))
}

/// Build the emulator command (piped for console control).
pub fn build_piped(line: &str) -> Command {
    let mut cmd = shell_command(line);
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    cmd
}
