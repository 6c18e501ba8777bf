//! Sandbox entry.
//!
//! Before the root directory changes, everything that would otherwise be
//! loaded lazily from the host filesystem (resolver libraries, time zone
//! data) is touched once, and the host files the daemon still needs are
//! copied under the sandbox root.

use std::fs;
use std::path::Path;

use tracing::{debug, info, warn};

use threatd_core::DetectorPaths;

use crate::error::{ServerError, ServerResult};
use crate::syscalls::SystemCalls;

/// Enters the sandbox and returns the path layout as seen from inside it.
///
/// Privileges are dropped only for non-root users; root keeps its
/// capabilities so it can still read files owned by other users.
pub fn enter_sandbox(
    syscalls: &dyn SystemCalls,
    paths: &DetectorPaths,
    warm_up_host: &str,
) -> ServerResult<DetectorPaths> {
    warm_up(syscalls, warm_up_host);
    import_host_files(paths);

    let root = paths.sandbox_root();
    syscalls
        .chroot(&root)
        .map_err(|source| ServerError::EnterSandbox {
            path: root.display().to_string(),
            source,
        })?;
    info!(root = %root.display(), "Entered sandbox");

    if !syscalls.is_superuser() {
        syscalls
            .drop_capabilities()
            .map_err(ServerError::DropCapabilities)?;
        syscalls
            .lock_capabilities()
            .map_err(ServerError::LockCapabilities)?;
        debug!("Dropped capabilities");
    }

    syscalls
        .chdir(Path::new("/"))
        .map_err(ServerError::ChangeDirectory)?;

    Ok(paths.entered_sandbox())
}

fn warm_up(syscalls: &dyn SystemCalls, host: &str) {
    if let Err(e) = syscalls.resolve_host(host) {
        debug!(host, error = %e, "Resolver warm-up failed");
    }
    // loads the local time zone while /etc/localtime is still reachable
    let now = chrono::Local::now();
    debug!(offset = %now.offset(), "Time zone loaded");
}

fn import_host_files(paths: &DetectorPaths) {
    for source in paths.sandbox_imports() {
        let target = paths.sandbox_copy_of(&source);
        if let Err(e) = copy_into_sandbox(&source, &target) {
            warn!(
                source = %source.display(),
                target = %target.display(),
                error = %e,
                "Failed to copy file into sandbox"
            );
        }
    }
}

fn copy_into_sandbox(source: &Path, target: &Path) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, target)?;
    Ok(())
}
