//! Locating executables on the search path.
//!
//! Backends take an `ExecutableLocator` instead of consulting `PATH`
//! directly, so tests can substitute a fake emulator.

use std::path::PathBuf;

pub trait ExecutableLocator: Send + Sync {
    /// Resolve `name` to an executable path, if one exists.
    fn locate(&self, name: &str) -> Option<PathBuf>;
}

/// Looks executables up on `PATH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchPath;

impl ExecutableLocator for SearchPath {
    fn locate(&self, name: &str) -> Option<PathBuf> {
        which::which(name).ok()
    }
}

/// Resolves every name to one fixed executable.
#[derive(Debug, Clone)]
pub struct FixedPath(pub PathBuf);

impl ExecutableLocator for FixedPath {
    fn locate(&self, _name: &str) -> Option<PathBuf> {
        self.0.is_file().then(|| self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_path_finds_shell() {
        assert!(SearchPath.locate("sh").is_some());
        assert!(SearchPath.locate("definitely-not-a-real-binary-1234").is_none());
    }

    #[test]
    fn test_fixed_path_requires_file() {
        assert!(FixedPath(PathBuf::from("/nonexistent/qemu")).locate("qemu").is_none());
    }
}
