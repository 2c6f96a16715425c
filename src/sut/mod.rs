//! Systems under test.
//!
//! A SUT is the target where tests are executed: the host itself or a
//! freshly booted virtual machine. Every variant has the same lifecycle:
//! `communicate()` blocks until the target is reachable, then `channel()`
//! and `downloader()` are available until `stop()` or `force_stop()`.

mod local;

pub use local::LocalSut;

use crate::channel::Channel;
use crate::downloader::Downloader;
use crate::error::Result;
use crate::qemu::{QemuConfig, QemuSut};
use std::sync::Arc;
use std::time::Duration;

/// Teardown bound used when the caller has no better value.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

pub trait Sut: Send + Sync {
    /// Stable identifier used by reporting: "host" or "qemu".
    fn name(&self) -> &str;

    /// Make the target reachable.
    ///
    /// `on_line` receives every console line produced while connecting.
    /// Fails with `SutError::AlreadyRunning` when called twice without a
    /// stop in between.
    fn communicate(&self, on_line: Option<&dyn Fn(&str)>) -> Result<()>;

    /// Graceful teardown, bounded by `timeout`.
    fn stop(&self, timeout: Duration) -> Result<()>;

    /// Unconditional teardown, bounded by `timeout`.
    fn force_stop(&self, timeout: Duration) -> Result<()>;

    /// Command channel, present once `communicate()` succeeded.
    fn channel(&self) -> Option<Arc<dyn Channel>>;

    fn downloader(&self) -> Option<Arc<dyn Downloader>>;

    fn is_running(&self) -> bool {
        self.channel().is_some()
    }
}

/// Which SUT to build.
pub enum SutKind {
    Host,
    Qemu(Box<QemuConfig>),
}

impl SutKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Qemu(_) => "qemu",
        }
    }
}

pub fn create_sut(kind: SutKind) -> Arc<dyn Sut> {
    match kind {
        SutKind::Host => Arc::new(LocalSut::new()),
        SutKind::Qemu(config) => Arc::new(QemuSut::new(*config)),
    }
}
