//! Expected shutdown marker.
//!
//! The daemon writes this file before a deliberate exit (idle restart,
//! control shutdown). A supervisor that finds it knows the exit was planned;
//! the next start removes it.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedShutdownMarker {
    path: PathBuf,
}

impl ExpectedShutdownMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Writes the marker. Failures are logged only.
    pub fn create(&self) {
        match fs::write(&self.path, b"") {
            Ok(()) => info!(path = %self.path.display(), "Wrote expected shutdown marker"),
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to write expected shutdown marker"
            ),
        }
    }

    /// Removes a marker left by a previous run.
    pub fn remove(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed stale expected shutdown marker"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to remove expected shutdown marker"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_then_remove() {
        let dir = tempdir().unwrap();
        let marker = ExpectedShutdownMarker::new(dir.path().join("expected_shutdown"));
        assert!(!marker.exists());
        marker.create();
        assert!(marker.exists());
        marker.remove();
        assert!(!marker.exists());
    }

    #[test]
    fn missing_directory_is_not_fatal() {
        let dir = tempdir().unwrap();
        let marker = ExpectedShutdownMarker::new(dir.path().join("absent/expected_shutdown"));
        marker.create();
        marker.remove();
        assert!(!marker.exists());
    }
}
