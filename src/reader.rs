//! Cancellable, timeout-bounded reader over a raw descriptor.
//!
//! `PollReader` owns one readable stream (a child's stdout, a socket, ...)
//! and an epoll registration for it. `read_until()` accumulates bytes until
//! a predicate over the whole buffer matches, the deadline passes, the
//! stream closes, or another thread calls `stop()`.
//!
//! Bytes are read one at a time and decoded individually: anything that is
//! not a complete character on its own is dropped. Console streams can emit
//! partial multi-byte sequences mid-scan, so this never fails on bad input.

use parking_lot::Mutex;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Upper bound (ms) on how long a blocked read can miss a `stop()` request.
pub const POLL_INTERVAL_MS: i32 = 1;

/// Why a `read_until()` call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The predicate matched the buffer.
    Matched,
    /// The deadline passed before the predicate matched.
    TimedOut,
    /// `stop()` was called.
    Stopped,
    /// The stream reached end-of-file.
    Closed,
}

/// Buffer accumulated by one `read_until()` call and the reason it ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    pub buffer: String,
    pub status: ReadStatus,
}

impl ReadOutcome {
    pub fn matched(&self) -> bool {
        self.status == ReadStatus::Matched
    }
}

/// Line-oriented reader with cooperative cancellation.
pub struct PollReader<S> {
    /// Guards the stream: one read operation in flight at a time.
    source: Mutex<S>,
    fd: RawFd,
    epfd: RawFd,
    /// Whether `fd` is still registered with `epfd`.
    registered: Mutex<bool>,
    stopped: AtomicBool,
    timed_out: AtomicBool,
}

impl<S: Read + AsRawFd> PollReader<S> {
    /// Register `source` for readiness polling.
    pub fn new(source: S) -> io::Result<Self> {
        let fd = source.as_raw_fd();

        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fd, &mut event) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(err);
        }

        Ok(Self {
            source: Mutex::new(source),
            fd,
            epfd,
            registered: Mutex::new(true),
            stopped: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
        })
    }

    /// Read until `predicate(buffer)` is true, `timeout` has elapsed since
    /// `start`, the stream closes, or the reader is stopped.
    ///
    /// `on_line` receives every completed line with trailing whitespace
    /// stripped. A line still in progress when the predicate matches is
    /// never reported.
    pub fn read_until<P>(
        &self,
        predicate: P,
        start: Instant,
        timeout: Duration,
        on_line: Option<&dyn Fn(&str)>,
    ) -> io::Result<ReadOutcome>
    where
        P: Fn(&str) -> bool,
    {
        self.timed_out.store(false, Ordering::SeqCst);

        let mut source = self.source.lock();
        let mut buffer = String::new();
        let mut line = String::new();

        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return Ok(ReadOutcome {
                    buffer,
                    status: ReadStatus::Stopped,
                });
            }

            if start.elapsed() >= timeout {
                self.timed_out.store(true, Ordering::SeqCst);
                return Ok(ReadOutcome {
                    buffer,
                    status: ReadStatus::TimedOut,
                });
            }

            if !self.wait_readable()? {
                continue;
            }

            let mut byte = [0u8; 1];
            let n = match source.read(&mut byte) {
                Ok(n) => n,
                Err(e)
                    if e.kind() == io::ErrorKind::Interrupted
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    continue
                }
                Err(e) => return Err(e),
            };

            if n == 0 {
                return Ok(ReadOutcome {
                    buffer,
                    status: ReadStatus::Closed,
                });
            }

            let Some(ch) = decode_byte(byte[0]) else {
                continue;
            };

            buffer.push(ch);
            line.push(ch);

            if ch == '\n' {
                if let Some(callback) = on_line {
                    callback(line.trim_end());
                }
                line.clear();
            }

            if predicate(&buffer) {
                return Ok(ReadOutcome {
                    buffer,
                    status: ReadStatus::Matched,
                });
            }
        }
    }

    /// Wait at most one poll interval for the descriptor to become readable.
    fn wait_readable(&self) -> io::Result<bool> {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }];
        let ret = unsafe {
            libc::epoll_wait(
                self.epfd,
                events.as_mut_ptr(),
                events.len() as i32,
                POLL_INTERVAL_MS,
            )
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }

        Ok(ret > 0 && events[0].u64 == self.fd as u64)
    }
}

impl<S> PollReader<S> {
    /// Stop reading. Safe to call from any thread, any number of times.
    ///
    /// The epoll registration is released once; a descriptor that is
    /// already invalid (owning process gone) is not an error.
    pub fn stop(&self) {
        let mut registered = self.registered.lock();
        self.stopped.store(true, Ordering::SeqCst);

        if *registered {
            *registered = false;
            unsafe {
                libc::epoll_ctl(
                    self.epfd,
                    libc::EPOLL_CTL_DEL,
                    self.fd,
                    std::ptr::null_mut(),
                );
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Whether the last `read_until()` ended on its deadline.
    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }
}

impl<S> Drop for PollReader<S> {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}

fn decode_byte(byte: u8) -> Option<char> {
    std::str::from_utf8(&[byte])
        .ok()
        .and_then(|s| s.chars().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;

    #[test]
    fn test_decode_byte_drops_partial_sequences() {
        assert_eq!(decode_byte(b'a'), Some('a'));
        assert_eq!(decode_byte(b'\n'), Some('\n'));
        assert_eq!(decode_byte(0xc3), None);
        assert_eq!(decode_byte(0xa9), None);
    }

    #[test]
    fn test_invalid_bytes_are_skipped() {
        let (reader_end, mut writer) = UnixStream::pair().unwrap();
        let reader = PollReader::new(reader_end).unwrap();

        writer.write_all(b"caf\xc3\xa9#").unwrap();

        let out = reader
            .read_until(|b| b.ends_with('#'), Instant::now(), Duration::from_secs(5), None)
            .unwrap();
        assert!(out.matched());
        assert_eq!(out.buffer, "caf#");
    }

    #[test]
    fn test_closed_stream() {
        let (reader_end, mut writer) = UnixStream::pair().unwrap();
        let reader = PollReader::new(reader_end).unwrap();

        writer.write_all(b"partial").unwrap();
        drop(writer);

        let out = reader
            .read_until(|_| false, Instant::now(), Duration::from_secs(5), None)
            .unwrap();
        assert_eq!(out.status, ReadStatus::Closed);
        assert_eq!(out.buffer, "partial");
        assert!(!reader.timed_out());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (reader_end, _writer) = UnixStream::pair().unwrap();
        let reader = Arc::new(PollReader::new(reader_end).unwrap());

        reader.stop();
        reader.stop();
        assert!(reader.is_stopped());

        let out = reader
            .read_until(|_| true, Instant::now(), Duration::from_secs(5), None)
            .unwrap();
        assert_eq!(out.status, ReadStatus::Stopped);
        assert!(out.buffer.is_empty());
    }
}
