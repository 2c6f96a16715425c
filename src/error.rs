//! Error taxonomy shared by every SUT backend.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by SUTs, channels and downloaders.
#[derive(Debug, Error)]
pub enum SutError {
    /// A configuration value or argument is missing or invalid.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// `communicate()` was called on a SUT that is already running.
    #[error("{0} is already running")]
    AlreadyRunning(String),

    /// A required executable is not on the search path.
    #[error("Command not found: {0}")]
    CommandNotFound(String),

    /// The backing process ended with a non-zero code.
    #[error("{what} ended with exit code {code}")]
    ProcessExited { what: String, code: i32 },

    /// Any other backend failure.
    #[error("{0}")]
    Backend(String),

    /// An operation exceeded its time bound.
    #[error("{0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SutError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    /// Timeout error naming the operation and its bound.
    pub fn timeout(what: impl AsRef<str>, bound: Duration) -> Self {
        Self::Timeout(format!("{} timed out after {:?}", what.as_ref(), bound))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, SutError>;
