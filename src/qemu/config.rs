//! Virtual machine configuration.
//!
//! `QemuOptions` is the raw, deserializable option set (TOML file or CLI).
//! `QemuConfig::new()` validates it once; a `QemuConfig` is never
//! re-checked afterwards.

use crate::error::{Result, SutError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Raw options for a QEMU virtual machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QemuOptions {
    /// Working directory for console logs and transport files (must exist).
    pub tmpdir: Option<PathBuf>,
    /// Bootable disk image (must exist).
    pub image: Option<PathBuf>,
    /// If set, `image` is copied here before boot and the copy is booted.
    pub image_overlay: Option<PathBuf>,
    /// Secondary image attached read-only.
    pub ro_image: Option<PathBuf>,
    pub user: String,
    pub password: String,
    /// Extra options passed verbatim to QEMU.
    pub options: Vec<String>,
    pub ram: String,
    pub smp: String,
    /// Host directory mounted read-only on /mnt through 9p.
    pub virtfs: Option<PathBuf>,
    /// Serial transport: "isa" or "virtio".
    pub serial: String,
    /// Guest path of the transport device, when it differs from the
    /// serial kind's default.
    pub transport_dev: Option<String>,
    /// Guest architecture, selects `qemu-system-<system>`.
    pub system: String,
    pub login_timeout_secs: u64,
    pub password_timeout_secs: u64,
    pub prompt_timeout_secs: u64,
}

impl Default for QemuOptions {
    fn default() -> Self {
        Self {
            tmpdir: None,
            image: None,
            image_overlay: None,
            ro_image: None,
            user: "root".to_string(),
            password: "root".to_string(),
            options: Vec::new(),
            ram: "2G".to_string(),
            smp: "2".to_string(),
            virtfs: None,
            serial: "isa".to_string(),
            transport_dev: None,
            system: "x86_64".to_string(),
            login_timeout_secs: 180,
            password_timeout_secs: 30,
            prompt_timeout_secs: 30,
        }
    }
}

impl QemuOptions {
    pub fn new(tmpdir: impl Into<PathBuf>, image: impl Into<PathBuf>) -> Self {
        Self {
            tmpdir: Some(tmpdir.into()),
            image: Some(image.into()),
            ..Self::default()
        }
    }

    /// Load options from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| SutError::invalid(format!("{}: {}", path.display(), e)))
    }

    pub fn image_overlay(mut self, path: impl Into<PathBuf>) -> Self {
        self.image_overlay = Some(path.into());
        self
    }

    pub fn ro_image(mut self, path: impl Into<PathBuf>) -> Self {
        self.ro_image = Some(path.into());
        self
    }

    pub fn user(mut self, user: &str) -> Self {
        self.user = user.to_string();
        self
    }

    pub fn password(mut self, password: &str) -> Self {
        self.password = password.to_string();
        self
    }

    /// Append a raw QEMU option.
    pub fn option(mut self, option: &str) -> Self {
        self.options.push(option.to_string());
        self
    }

    /// Set memory size (e.g., "512M", "2G")
    pub fn ram(mut self, ram: &str) -> Self {
        self.ram = ram.to_string();
        self
    }

    pub fn smp(mut self, smp: &str) -> Self {
        self.smp = smp.to_string();
        self
    }

    pub fn virtfs(mut self, path: impl Into<PathBuf>) -> Self {
        self.virtfs = Some(path.into());
        self
    }

    pub fn serial(mut self, serial: &str) -> Self {
        self.serial = serial.to_string();
        self
    }

    pub fn transport_dev(mut self, dev: &str) -> Self {
        self.transport_dev = Some(dev.to_string());
        self
    }

    pub fn system(mut self, system: &str) -> Self {
        self.system = system.to_string();
        self
    }

    /// Bound every login dialogue step by `timeout`.
    pub fn dialogue_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout_secs = timeout.as_secs();
        self.password_timeout_secs = timeout.as_secs();
        self.prompt_timeout_secs = timeout.as_secs();
        self
    }
}

/// How the transport serial device is exposed to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialKind {
    /// Two ISA serial lines: ttyS0 console, ttyS1 transport.
    Isa,
    /// virtio-serial bus with a console port and a transport port.
    Virtio,
}

impl SerialKind {
    /// Transport device path as seen from inside the guest.
    pub fn transport_dev(&self) -> &'static str {
        match self {
            Self::Isa => "/dev/ttyS1",
            Self::Virtio => "/dev/vport1p1",
        }
    }
}

impl FromStr for SerialKind {
    type Err = SutError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "isa" => Ok(Self::Isa),
            "virtio" => Ok(Self::Virtio),
            _ => Err(SutError::invalid("Serial protocol must be isa or virtio")),
        }
    }
}

impl fmt::Display for SerialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Isa => write!(f, "isa"),
            Self::Virtio => write!(f, "virtio"),
        }
    }
}

/// Validated virtual machine configuration.
#[derive(Debug, Clone)]
pub struct QemuConfig {
    tmpdir: PathBuf,
    image: PathBuf,
    image_overlay: Option<PathBuf>,
    ro_image: Option<PathBuf>,
    user: String,
    password: String,
    options: Vec<String>,
    ram: String,
    smp: String,
    virtfs: Option<PathBuf>,
    serial: SerialKind,
    transport_dev: Option<String>,
    system: String,
    login_timeout: Duration,
    password_timeout: Duration,
    prompt_timeout: Duration,
}

impl QemuConfig {
    pub fn new(options: QemuOptions) -> Result<Self> {
        let tmpdir = match options.tmpdir {
            Some(dir) if dir.is_dir() => dir,
            _ => return Err(SutError::invalid("temporary directory doesn't exist")),
        };

        let image = match options.image {
            Some(image) if image.is_file() => image,
            _ => return Err(SutError::invalid("Image location doesn't exist")),
        };

        if let Some(ro_image) = &options.ro_image {
            if !ro_image.is_file() {
                return Err(SutError::invalid("Read-only image location doesn't exist"));
            }
        }

        if options.ram.is_empty() {
            return Err(SutError::invalid("RAM is not defined"));
        }

        if options.smp.is_empty() {
            return Err(SutError::invalid("CPU is not defined"));
        }

        if let Some(virtfs) = &options.virtfs {
            if !virtfs.is_dir() {
                return Err(SutError::invalid("Virtual FS directory doesn't exist"));
            }
        }

        let serial = options.serial.parse()?;

        if options.transport_dev.as_deref() == Some("") {
            return Err(SutError::invalid("Transport device is empty"));
        }

        if options.system.is_empty() {
            return Err(SutError::invalid("System architecture is not defined"));
        }

        Ok(Self {
            tmpdir,
            image,
            image_overlay: options.image_overlay,
            ro_image: options.ro_image,
            user: options.user,
            password: options.password,
            options: options.options,
            ram: options.ram,
            smp: options.smp,
            virtfs: options.virtfs,
            serial,
            transport_dev: options.transport_dev,
            system: options.system,
            login_timeout: Duration::from_secs(options.login_timeout_secs),
            password_timeout: Duration::from_secs(options.password_timeout_secs),
            prompt_timeout: Duration::from_secs(options.prompt_timeout_secs),
        })
    }

    /// Name of the emulator executable, e.g. `qemu-system-x86_64`.
    pub fn emulator(&self) -> String {
        format!("qemu-system-{}", self.system)
    }

    pub fn tmpdir(&self) -> &Path {
        &self.tmpdir
    }

    pub fn image(&self) -> &Path {
        &self.image
    }

    pub fn image_overlay(&self) -> Option<&Path> {
        self.image_overlay.as_deref()
    }

    pub fn ro_image(&self) -> Option<&Path> {
        self.ro_image.as_deref()
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    pub fn ram(&self) -> &str {
        &self.ram
    }

    pub fn smp(&self) -> &str {
        &self.smp
    }

    pub fn virtfs(&self) -> Option<&Path> {
        self.virtfs.as_deref()
    }

    pub fn serial(&self) -> SerialKind {
        self.serial
    }

    /// Guest path the serial channel writes file transfers to.
    pub fn transport_dev(&self) -> &str {
        self.transport_dev
            .as_deref()
            .unwrap_or_else(|| self.serial.transport_dev())
    }

    pub fn login_timeout(&self) -> Duration {
        self.login_timeout
    }

    pub fn password_timeout(&self) -> Duration {
        self.password_timeout
    }

    pub fn prompt_timeout(&self) -> Duration {
        self.prompt_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("image.qcow2");
        std::fs::write(&image, b"").unwrap();
        (dir, image)
    }

    fn invalid_message(options: QemuOptions) -> String {
        match QemuConfig::new(options) {
            Err(SutError::InvalidArgument(msg)) => msg,
            other => panic!("expected InvalidArgument, got {:?}", other),
        }
    }

    #[test]
    fn test_defaults() {
        let (dir, image) = workspace();
        let config = QemuConfig::new(QemuOptions::new(dir.path(), &image)).unwrap();

        assert_eq!(config.user(), "root");
        assert_eq!(config.password(), "root");
        assert_eq!(config.ram(), "2G");
        assert_eq!(config.smp(), "2");
        assert_eq!(config.serial(), SerialKind::Isa);
        assert_eq!(config.emulator(), "qemu-system-x86_64");
        assert_eq!(config.login_timeout(), Duration::from_secs(180));
        assert!(config.virtfs().is_none());
    }

    #[test]
    fn test_missing_tmpdir() {
        let (dir, image) = workspace();
        let msg = invalid_message(QemuOptions::new(dir.path().join("nope"), &image));
        assert_eq!(msg, "temporary directory doesn't exist");

        let msg = invalid_message(QemuOptions {
            image: Some(image),
            ..QemuOptions::default()
        });
        assert_eq!(msg, "temporary directory doesn't exist");
    }

    #[test]
    fn test_missing_image() {
        let (dir, _) = workspace();
        let msg = invalid_message(QemuOptions::new(dir.path(), dir.path().join("missing.qcow2")));
        assert_eq!(msg, "Image location doesn't exist");
    }

    #[test]
    fn test_missing_ro_image() {
        let (dir, image) = workspace();
        let msg = invalid_message(
            QemuOptions::new(dir.path(), &image).ro_image(dir.path().join("ro.img")),
        );
        assert_eq!(msg, "Read-only image location doesn't exist");
    }

    #[test]
    fn test_empty_ram_and_smp() {
        let (dir, image) = workspace();
        let msg = invalid_message(QemuOptions::new(dir.path(), &image).ram(""));
        assert_eq!(msg, "RAM is not defined");

        let msg = invalid_message(QemuOptions::new(dir.path(), &image).smp(""));
        assert_eq!(msg, "CPU is not defined");
    }

    #[test]
    fn test_virtfs_must_be_directory() {
        let (dir, image) = workspace();
        let msg = invalid_message(QemuOptions::new(dir.path(), &image).virtfs(&image));
        assert_eq!(msg, "Virtual FS directory doesn't exist");

        let config = QemuConfig::new(QemuOptions::new(dir.path(), &image).virtfs(dir.path())).unwrap();
        assert_eq!(config.virtfs(), Some(dir.path()));
    }

    #[test]
    fn test_serial_kind() {
        let (dir, image) = workspace();
        let msg = invalid_message(QemuOptions::new(dir.path(), &image).serial("pci"));
        assert_eq!(msg, "Serial protocol must be isa or virtio");

        let config = QemuConfig::new(QemuOptions::new(dir.path(), &image).serial("virtio")).unwrap();
        assert_eq!(config.serial(), SerialKind::Virtio);
        assert_eq!(config.transport_dev(), "/dev/vport1p1");
        assert_eq!(SerialKind::Isa.transport_dev(), "/dev/ttyS1");
    }

    #[test]
    fn test_transport_dev_override() {
        let (dir, image) = workspace();
        let config =
            QemuConfig::new(QemuOptions::new(dir.path(), &image).transport_dev("/dev/hvc1")).unwrap();
        assert_eq!(config.serial(), SerialKind::Isa);
        assert_eq!(config.transport_dev(), "/dev/hvc1");

        let msg = invalid_message(QemuOptions::new(dir.path(), &image).transport_dev(""));
        assert_eq!(msg, "Transport device is empty");
    }

    #[test]
    fn test_from_toml_file() {
        let (dir, image) = workspace();
        let path = dir.path().join("vm.toml");
        std::fs::write(
            &path,
            format!(
                "tmpdir = {:?}\nimage = {:?}\nram = \"4G\"\nserial = \"virtio\"\noptions = [\"-cpu host\"]\n",
                dir.path(),
                image
            ),
        )
        .unwrap();

        let options = QemuOptions::from_toml_file(&path).unwrap();
        assert_eq!(options.ram, "4G");
        assert_eq!(options.smp, "2");
        assert_eq!(options.options, vec!["-cpu host".to_string()]);

        let config = QemuConfig::new(options).unwrap();
        assert_eq!(config.serial(), SerialKind::Virtio);
    }
}
