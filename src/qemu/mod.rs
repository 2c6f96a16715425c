//! QEMU virtual machine backend.
//!
//! Boots a disk image, logs in over the serial console and exposes a
//! `SerialChannel` on top of it.

mod command;
mod config;
mod dialogue;
mod sut;

pub use command::{command_line, qemu_params, SessionFiles};
pub use config::{QemuConfig, QemuOptions, SerialKind};
pub use dialogue::{LoginStep, IMAGE_LOCKED, LOGIN_PROMPT, PASSWORD_PROMPTS, SHELL_PROMPT};
pub use sut::QemuSut;
