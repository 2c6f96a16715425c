//! Systems under test for command-level test harnesses.
//!
//! A harness picks a SUT, calls `communicate()` to make it reachable and
//! then drives its `Channel` and `Downloader`:
//! - `LocalSut` runs commands on the host
//! - `QemuSut` boots a disk image, logs in over the serial console and
//!   runs commands through it
//!
//! The building block underneath is `PollReader`, a cancellable reader
//! that scans a process stream until a predicate matches.

pub mod channel;
pub mod downloader;
pub mod error;
pub mod locate;
pub mod process;
pub mod qemu;
pub mod reader;
pub mod sut;

// Re-export commonly used items
pub use channel::{Channel, CommandEnv, CommandOutput, SerialChannel, ShellChannel};
pub use downloader::{Downloader, LocalDownloader, TransportDownloader};
pub use error::{Result, SutError};
pub use locate::{ExecutableLocator, FixedPath, SearchPath};
pub use qemu::{LoginStep, QemuConfig, QemuOptions, QemuSut, SerialKind};
pub use reader::{PollReader, ReadOutcome, ReadStatus};
pub use sut::{create_sut, LocalSut, Sut, SutKind, DEFAULT_STOP_TIMEOUT};
