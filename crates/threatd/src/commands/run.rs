//! `threatd run`: the daemon itself.

use std::path::PathBuf;
use std::time::Duration;

use tracing::info;

use threatd_core::{DetectorPaths, default_install_root};
use threatd_server::{
    DEFAULT_FORCE_EXIT_TIMEOUT, DetectorConfig, DetectorExit, ProductionResources, run_detector,
};

/// Grace period used when `threatd` is started without a subcommand.
pub const DEFAULT_FORCE_EXIT_SECS: u64 = DEFAULT_FORCE_EXIT_TIMEOUT.as_secs();

/// Exit used when the process fails before the detector starts, e.g. when
/// logging cannot be set up.
pub const STARTUP_FAILED: DetectorExit = DetectorExit::RuntimeError;

/// Process status byte for `exit`.
pub fn exit_status(exit: DetectorExit) -> u8 {
    u8::try_from(exit.code()).unwrap_or(1)
}

/// Builds the daemon configuration from the command line.
pub fn daemon_config(
    install_root: Option<PathBuf>,
    no_sandbox: bool,
    force_exit_timeout: Duration,
) -> DetectorConfig {
    let paths = DetectorPaths::new(install_root.unwrap_or_else(default_install_root));
    let mut config = DetectorConfig::new(paths).with_force_exit_timeout(force_exit_timeout);
    if no_sandbox {
        config = config.with_sandbox(false);
    }
    config
}

/// Runs the daemon in the foreground until it decides to exit.
pub fn run(config: DetectorConfig) -> DetectorExit {
    info!(
        install_root = %config.paths.install_root().display(),
        sandbox = config.sandbox,
        "Starting threat detector"
    );
    run_detector(&ProductionResources, config)
}
