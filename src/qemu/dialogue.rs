//! Console login dialogue.
//!
//! Login is a fixed three-step exchange with the guest getty:
//! wait for `login:` and send the user, wait for `Password:` and send the
//! password, wait for the shell prompt and send an empty line.

use super::config::QemuConfig;
use std::time::Duration;

/// Getty login prompt.
pub const LOGIN_PROMPT: &str = "login:";

pub const PASSWORD_PROMPTS: &[&str] = &["Password:", "password:"];

/// Root shell prompt.
pub const SHELL_PROMPT: &str = "#";

/// QEMU refuses to boot an image locked by another instance.
pub const IMAGE_LOCKED: &str = "Is another process using the image";

/// One step of the login dialogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStep {
    /// Waiting for the getty login prompt.
    LoginPrompt,
    /// User sent, waiting for the password prompt.
    PasswordPrompt,
    /// Password sent, waiting for the shell prompt.
    ShellPrompt,
}

impl LoginStep {
    /// Steps in the order they run.
    pub const SEQUENCE: [LoginStep; 3] = [
        LoginStep::LoginPrompt,
        LoginStep::PasswordPrompt,
        LoginStep::ShellPrompt,
    ];

    pub fn description(&self) -> &'static str {
        match self {
            Self::LoginPrompt => "login message",
            Self::PasswordPrompt => "password message",
            Self::ShellPrompt => "shell prompt",
        }
    }

    /// Error message when the step never sees its prompt.
    pub fn missing_message(&self) -> String {
        format!("Can't find {}", self.description())
    }

    /// Whether `buffer` ends the step.
    pub fn matches(&self, buffer: &str) -> bool {
        match self {
            Self::LoginPrompt => buffer.ends_with(LOGIN_PROMPT) || image_locked(buffer),
            Self::PasswordPrompt => PASSWORD_PROMPTS.iter().any(|p| buffer.ends_with(p)),
            Self::ShellPrompt => buffer.ends_with(SHELL_PROMPT),
        }
    }

    pub fn timeout(&self, config: &QemuConfig) -> Duration {
        match self {
            Self::LoginPrompt => config.login_timeout(),
            Self::PasswordPrompt => config.password_timeout(),
            Self::ShellPrompt => config.prompt_timeout(),
        }
    }

    /// Line typed into the console once the step matched.
    pub fn reply<'a>(&self, config: &'a QemuConfig) -> &'a str {
        match self {
            Self::LoginPrompt => config.user(),
            Self::PasswordPrompt => config.password(),
            Self::ShellPrompt => "",
        }
    }
}

pub fn image_locked(buffer: &str) -> bool {
    buffer.ends_with(IMAGE_LOCKED)
}
