//! Exclusive pid lock.
//!
//! A second daemon must not run against the same sandbox. The lock is an
//! `flock(2)` on the pid file, so a crashed daemon never leaves a stale lock
//! behind: the kernel releases it with the file descriptor.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, info, warn};

use crate::error::{ServerError, ServerResult};

/// Holds the pid lock until dropped; the pid file is removed on drop.
pub struct PidLock {
    path: PathBuf,
    _file: Flock<File>,
}

impl std::fmt::Debug for PidLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PidLock").field("path", &self.path).finish()
    }
}

impl PidLock {
    /// Takes the lock and records our pid.
    ///
    /// Fails with [`ServerError::AlreadyRunning`] if another process holds it.
    pub fn acquire(path: impl Into<PathBuf>) -> ServerResult<Self> {
        let path = path.into();

        if let Some(parent) = path.parent()
            && !parent.exists()
        {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(&path)?;

        let mut file = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(
            |(_, errno)| match errno {
                Errno::EWOULDBLOCK => ServerError::already_running(&path),
                other => ServerError::system(format!("flock {}", path.display()), other),
            },
        )?;

        // the lock is ours, whatever an earlier holder left is stale
        file.set_len(0)?;
        writeln!(file, "{}", process::id())?;
        file.sync_all()?;

        info!(path = %path.display(), pid = process::id(), "Acquired pid lock");

        Ok(Self { path, _file: file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to remove pid file"
            );
        } else {
            debug!(path = %self.path.display(), "Removed pid file");
        }
    }
}
