//! Downloader for virtual machines, backed by the serial transport device.

use super::Downloader;
use crate::channel::SerialChannel;
use crate::error::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub struct TransportDownloader {
    channel: Arc<SerialChannel>,
}

impl TransportDownloader {
    pub fn new(channel: Arc<SerialChannel>) -> Self {
        Self { channel }
    }
}

impl Downloader for TransportDownloader {
    fn fetch_file(&self, target_path: &Path, local_path: &Path, timeout: Duration) -> Result<()> {
        self.channel.fetch_file(target_path, local_path, timeout)
    }

    fn stop(&self) {
        self.channel.request_stop();
    }
}
