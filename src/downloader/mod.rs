//! File transfer from a SUT to the local host.

mod local;
mod transport;

pub use local::LocalDownloader;
pub use transport::TransportDownloader;

use crate::error::Result;
use std::path::Path;
use std::time::Duration;

pub trait Downloader: Send + Sync {
    /// Copy `target_path` on the SUT to `local_path` on the host.
    fn fetch_file(&self, target_path: &Path, local_path: &Path, timeout: Duration) -> Result<()>;

    /// Interrupt the transfer in progress, if any.
    fn stop(&self);
}
