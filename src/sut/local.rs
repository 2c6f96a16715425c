//! The host itself as a SUT.

use super::Sut;
use crate::channel::{Channel, ShellChannel};
use crate::downloader::{Downloader, LocalDownloader};
use crate::error::{Result, SutError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
pub struct LocalSut {
    channel: Mutex<Option<Arc<ShellChannel>>>,
    downloader: Mutex<Option<Arc<LocalDownloader>>>,
}

impl LocalSut {
    pub fn new() -> Self {
        Self::default()
    }

    fn release(&self) {
        *self.channel.lock() = None;
        *self.downloader.lock() = None;
    }
}

impl Sut for LocalSut {
    fn name(&self) -> &str {
        "host"
    }

    fn communicate(&self, _on_line: Option<&dyn Fn(&str)>) -> Result<()> {
        let mut channel = self.channel.lock();
        let mut downloader = self.downloader.lock();

        if channel.is_some() || downloader.is_some() {
            return Err(SutError::AlreadyRunning("SUT".into()));
        }

        *channel = Some(Arc::new(ShellChannel::new()));
        *downloader = Some(Arc::new(LocalDownloader::new()));
        Ok(())
    }

    fn stop(&self, timeout: Duration) -> Result<()> {
        let channel = self.channel.lock().clone();
        if let Some(channel) = channel {
            channel.stop(timeout)?;
        }
        let downloader = self.downloader.lock().clone();
        if let Some(downloader) = downloader {
            downloader.stop();
        }
        self.release();
        Ok(())
    }

    fn force_stop(&self, timeout: Duration) -> Result<()> {
        let channel = self.channel.lock().clone();
        if let Some(channel) = channel {
            channel.force_stop(timeout)?;
        }
        let downloader = self.downloader.lock().clone();
        if let Some(downloader) = downloader {
            downloader.stop();
        }
        self.release();
        Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_communicate_twice_fails() {
        let sut = LocalSut::new();
        assert!(!sut.is_running());

        sut.communicate(None).unwrap();
        assert!(sut.channel().is_some());
        assert!(sut.downloader().is_some());

        for _ in 0..2 {
            let err = sut.communicate(None).unwrap_err();
            assert!(matches!(err, SutError::AlreadyRunning(_)));
        }
    }

    #[test]
    fn test_stop_allows_restart() {
        let sut = LocalSut::new();
        sut.communicate(None).unwrap();
        sut.stop(Duration::from_secs(5)).unwrap();
        assert!(sut.channel().is_none());

        sut.communicate(None).unwrap();
        sut.force_stop(Duration::from_secs(5)).unwrap();
        assert!(!sut.is_running());
    }

    #[test]
    fn test_stop_before_communicate_is_noop() {
        let sut = LocalSut::new();
        sut.stop(Duration::from_secs(1)).unwrap();
        sut.force_stop(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_runs_commands_on_host() {
        let sut = LocalSut::new();
        sut.communicate(None).unwrap();

        let out = sut
            .channel()
            .unwrap()
            .run_cmd_ok("echo host", Duration::from_secs(10))
            .unwrap();
        assert_eq!(out, "host\n");
        assert_eq!(sut.name(), "host");
    }
}
