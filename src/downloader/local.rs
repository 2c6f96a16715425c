//! Fallback downloader for host testing: a plain file copy.

use super::Downloader;
use crate::error::{Result, SutError};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Default)]
pub struct LocalDownloader {
    fetching: AtomicBool,
}

impl LocalDownloader {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Downloader for LocalDownloader {
    fn fetch_file(&self, target_path: &Path, local_path: &Path, timeout: Duration) -> Result<()> {
        if target_path.as_os_str().is_empty() {
            return Err(SutError::invalid("target path is empty"));
        }
        if local_path.as_os_str().is_empty() {
            return Err(SutError::invalid("local path is empty"));
        }
        if !target_path.is_file() {
            return Err(SutError::invalid("target file doesn't exist"));
        }

        info!("Copy '{}' to '{}'", target_path.display(), local_path.display());

        self.fetching.store(true, Ordering::SeqCst);
        let start = Instant::now();

        let mut source = File::open(target_path)?;
        let mut dest = File::create(local_path)?;
        let mut data = [0u8; 1024];

        loop {
            let n = source.read(&mut data)?;
            if n == 0 || !self.fetching.load(Ordering::SeqCst) {
                break;
            }
            dest.write_all(&data[..n])?;

            if start.elapsed() >= timeout {
                info!("Transfer timed out after {:?}", timeout);
                self.fetching.store(false, Ordering::SeqCst);
                return Err(SutError::timeout(
                    format!("Transfer {} -> {}", target_path.display(), local_path.display()),
                    timeout,
                ));
            }
        }

        if self.fetching.swap(false, Ordering::SeqCst) {
            info!("File copied");
        } else {
            info!("Copy stopped");
        }
        Ok(())
    }

    fn stop(&self) {
        info!("Stopping all current operations");
        self.fetching.store(false, Ordering::SeqCst);
    }
}
