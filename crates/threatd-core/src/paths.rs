//! Install and sandbox path layout.
//!
//! Everything the daemon touches lives under one install root. Files that
//! must stay reachable after the daemon has entered its sandbox live under
//! the sandbox root (`<plugin>/chroot`). Once the sandbox has been entered,
//! the same relative paths are resolved against `/` instead, see
//! [`DetectorPaths::entered_sandbox`].

use std::path::{Path, PathBuf};

/// Environment variable overriding the default install root.
pub const INSTALL_ROOT_ENV: &str = "THREATD_INSTALL";

const DEFAULT_INSTALL_ROOT: &str = "/opt/threatd";

/// Files copied into the sandbox that identify the host.
const HOST_IDENTITY_FILES: &[&str] = &["plugins/av/VERSION.ini", "base/etc/machine_id.txt"];

/// Files copied into the sandbox so name resolution keeps working.
const NAME_RESOLUTION_FILES: &[&str] = &[
    "/etc/hosts",
    "/etc/resolv.conf",
    "/etc/nsswitch.conf",
    "/etc/host.conf",
    "/etc/ld.so.cache",
];

/// Resolved path layout for one daemon instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorPaths {
    install_root: PathBuf,
    /// Where sandbox-relative paths are resolved from right now.
    sandbox_view: PathBuf,
}

impl DetectorPaths {
    /// Creates the layout for the given install root, as seen from outside
    /// the sandbox.
    pub fn new(install_root: impl Into<PathBuf>) -> Self {
        let install_root = install_root.into();
        let sandbox_view = install_root.join("plugins/av/chroot");
        Self {
            install_root,
            sandbox_view,
        }
    }

    /// Returns the layout as seen from inside the sandbox, where the sandbox
    /// root has become `/`.
    #[must_use]
    pub fn entered_sandbox(&self) -> Self {
        Self {
            install_root: self.install_root.clone(),
            sandbox_view: PathBuf::from("/"),
        }
    }

    /// Returns the install root.
    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    /// Returns the plugin directory.
    pub fn plugin_root(&self) -> PathBuf {
        self.install_root.join("plugins/av")
    }

    /// Returns the sandbox root on the host filesystem.
    pub fn sandbox_root(&self) -> PathBuf {
        self.plugin_root().join("chroot")
    }

    /// Resolves a sandbox-relative path against the current view.
    pub fn in_sandbox(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.sandbox_view.join(relative)
    }

    /// Maps a host path to its copy inside the sandbox root.
    pub fn sandbox_copy_of(&self, host_path: &Path) -> PathBuf {
        let relative = host_path.strip_prefix("/").unwrap_or(host_path);
        self.sandbox_root().join(relative)
    }

    /// Returns the daemon log file (outside the sandbox).
    pub fn log_file(&self) -> PathBuf {
        self.plugin_root().join("log/threat_detector.log")
    }

    /// Returns the proxy configuration file (outside the sandbox).
    pub fn proxy_config(&self) -> PathBuf {
        self.install_root.join("base/etc/current_proxy")
    }

    /// Returns every host file copied into the sandbox before entering it.
    pub fn sandbox_imports(&self) -> Vec<PathBuf> {
        HOST_IDENTITY_FILES
            .iter()
            .map(|p| self.install_root.join(p))
            .chain(NAME_RESOLUTION_FILES.iter().map(PathBuf::from))
            .collect()
    }

    /// Pid lock file.
    pub fn pid_file(&self) -> PathBuf {
        self.in_sandbox("var/threat_detector.pid")
    }

    /// Marker written before a deliberate shutdown or restart.
    pub fn expected_shutdown_marker(&self) -> PathBuf {
        self.in_sandbox("var/threat_detector_expected_shutdown")
    }

    /// Idle shutdown timeout configuration (JSON).
    pub fn shutdown_timeout_config(&self) -> PathBuf {
        self.in_sandbox("var/threat_detector_config")
    }

    /// Rescan interval configuration (plain integer seconds).
    pub fn rescan_interval_config(&self) -> PathBuf {
        self.in_sandbox("var/rescan_interval")
    }

    /// Scan engine settings (JSON).
    pub fn engine_settings(&self) -> PathBuf {
        self.in_sandbox("var/engine_settings.json")
    }

    /// Scan engine data directory.
    pub fn engine_data_dir(&self) -> PathBuf {
        self.in_sandbox("var/engine")
    }

    /// Socket accepting scan requests.
    pub fn scanning_socket(&self) -> PathBuf {
        self.in_sandbox("var/scanning_socket")
    }

    /// Socket accepting metadata rescan requests.
    pub fn metadata_rescan_socket(&self) -> PathBuf {
        self.in_sandbox("var/metadata_rescan_socket")
    }

    /// Socket accepting process control commands.
    pub fn control_socket(&self) -> PathBuf {
        self.in_sandbox("var/process_control_socket")
    }

    /// Socket on-access cache clients subscribe to for update-complete notices.
    pub fn update_complete_socket(&self) -> PathBuf {
        self.in_sandbox("var/update_complete_socket")
    }

    /// Socket detections are reported to.
    pub fn threat_report_socket(&self) -> PathBuf {
        self.in_sandbox("var/threat_report_socket")
    }

    /// Socket of the quarantine store's rescan service.
    pub fn rescan_service_socket(&self) -> PathBuf {
        self.in_sandbox("var/safestore_rescan_socket")
    }
}

impl Default for DetectorPaths {
    fn default() -> Self {
        Self::new(default_install_root())
    }
}

/// Returns the install root.
///
/// Uses `$THREATD_INSTALL` if set, otherwise `/opt/threatd`.
pub fn default_install_root() -> PathBuf {
    std::env::var_os(INSTALL_ROOT_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_INSTALL_ROOT))
}
