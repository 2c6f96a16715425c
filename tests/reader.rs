//! PollReader behaviour against a live socket pair.

use parking_lot::Mutex;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use sut_harness::{PollReader, ReadStatus};

fn pair() -> (PollReader<UnixStream>, UnixStream) {
    let (reader_end, writer) = UnixStream::pair().unwrap();
    (PollReader::new(reader_end).unwrap(), writer)
}

#[test]
fn test_reads_until_prompt_and_reports_lines() {
    let (reader, mut writer) = pair();
    writer.write_all(b"abc\ndef\n123#").unwrap();

    let lines = Mutex::new(Vec::new());
    let collect = |line: &str| lines.lock().push(line.to_string());

    let out = reader
        .read_until(
            |b| b.ends_with('#'),
            Instant::now(),
            Duration::from_secs(5),
            Some(&collect),
        )
        .unwrap();

    assert_eq!(out.status, ReadStatus::Matched);
    assert_eq!(out.buffer, "abc\ndef\n123#");
    assert_eq!(*lines.lock(), vec!["abc".to_string(), "def".to_string()]);
    assert!(!reader.timed_out());
}

#[test]
fn test_match_mid_stream_leaves_the_rest() {
    let (reader, mut writer) = pair();
    writer.write_all(b"login: root\nmore\n").unwrap();

    let lines = Mutex::new(Vec::new());
    let collect = |line: &str| lines.lock().push(line.to_string());

    let out = reader
        .read_until(
            |b| b.ends_with("login:"),
            Instant::now(),
            Duration::from_secs(5),
            Some(&collect),
        )
        .unwrap();
    assert_eq!(out.buffer, "login:");
    assert!(lines.lock().is_empty());

    let out = reader
        .read_until(
            |b| b.ends_with("more\n"),
            Instant::now(),
            Duration::from_secs(5),
            Some(&collect),
        )
        .unwrap();
    assert_eq!(out.buffer, " root\nmore\n");
    assert_eq!(*lines.lock(), vec![" root".to_string(), "more".to_string()]);
}

#[test]
fn test_timeout() {
    let (reader, mut writer) = pair();
    writer.write_all(b"no prompt here\n").unwrap();

    let start = Instant::now();
    let out = reader
        .read_until(|b| b.ends_with('#'), start, Duration::from_millis(200), None)
        .unwrap();

    assert_eq!(out.status, ReadStatus::TimedOut);
    assert_eq!(out.buffer, "no prompt here\n");
    assert!(reader.timed_out());
    assert!(!reader.is_stopped());
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(200) + Duration::from_secs(1), "{:?}", elapsed);
}

#[test]
fn test_timed_out_flag_resets_on_next_read() {
    let (reader, mut writer) = pair();

    let out = reader
        .read_until(|_| true, Instant::now(), Duration::from_millis(50), None)
        .unwrap();
    assert_eq!(out.status, ReadStatus::TimedOut);
    assert!(reader.timed_out());

    writer.write_all(b"x").unwrap();
    let out = reader
        .read_until(|_| true, Instant::now(), Duration::from_secs(5), None)
        .unwrap();
    assert!(out.matched());
    assert!(!reader.timed_out());
}

#[test]
fn test_stop_from_another_thread() {
    let (reader, _writer) = pair();
    let reader = Arc::new(reader);

    let worker = {
        let reader = reader.clone();
        thread::spawn(move || {
            reader.read_until(|_| false, Instant::now(), Duration::from_secs(60), None)
        })
    };

    thread::sleep(Duration::from_millis(100));
    let stopped_at = Instant::now();
    reader.stop();

    let out = worker.join().unwrap().unwrap();
    assert!(stopped_at.elapsed() < Duration::from_secs(1));
    assert_eq!(out.status, ReadStatus::Stopped);
    assert!(reader.is_stopped());
    assert!(!reader.timed_out());
}
