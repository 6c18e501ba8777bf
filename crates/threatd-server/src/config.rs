//! Daemon configuration.

use std::path::PathBuf;
use std::time::Duration;

use threatd_core::DetectorPaths;

use crate::force_exit::DEFAULT_FORCE_EXIT_TIMEOUT;

/// Settings for one listening socket.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Path to the Unix socket.
    pub socket_path: PathBuf,

    /// Read/write timeout applied to every accepted connection.
    pub connection_timeout: Duration,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Whether to remove stale socket on startup.
    pub cleanup_stale_socket: bool,

    /// Permission bits applied to the socket file after binding.
    pub mode: u32,
}

impl SocketConfig {
    /// Creates a socket configuration with the default limits.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            connection_timeout: Duration::from_secs(30),
            max_connections: 100,
            cleanup_stale_socket: true,
            mode: 0o600,
        }
    }

    /// Builder: set connection timeout.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Builder: set max connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Builder: set cleanup stale socket.
    pub fn with_cleanup_stale_socket(mut self, cleanup: bool) -> Self {
        self.cleanup_stale_socket = cleanup;
        self
    }

    /// Builder: set socket permission bits.
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }
}

/// How the rescan worker retries reaching the rescan service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RescanRetryPolicy {
    /// Connection attempts per rescan request.
    pub attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl Default for RescanRetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_secs(1),
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Path layout as seen before entering the sandbox.
    pub paths: DetectorPaths,

    /// Whether bootstrap enters the sandbox. Defaults to the `sandbox` feature.
    pub sandbox: bool,

    /// Grace period before the watchdog forces the process down.
    pub force_exit_timeout: Duration,

    /// Permission bits of the sockets other processes connect to.
    pub socket_mode: u32,

    /// Permission bits of the process control socket.
    pub control_socket_mode: u32,

    /// Per-connection read/write timeout.
    pub connection_timeout: Duration,

    /// Maximum concurrent connections per socket.
    pub max_connections: usize,

    pub rescan_retry: RescanRetryPolicy,

    /// Host resolved once before entering the sandbox to load the resolver.
    pub warm_up_host: String,
}

impl DetectorConfig {
    pub fn new(paths: DetectorPaths) -> Self {
        Self {
            paths,
            sandbox: cfg!(feature = "sandbox"),
            force_exit_timeout: DEFAULT_FORCE_EXIT_TIMEOUT,
            socket_mode: 0o666,
            control_socket_mode: 0o600,
            connection_timeout: Duration::from_secs(30),
            max_connections: 100,
            rescan_retry: RescanRetryPolicy::default(),
            warm_up_host: "localhost".to_string(),
        }
    }

    /// Builder: enable or disable the sandbox.
    pub fn with_sandbox(mut self, sandbox: bool) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Builder: set the force-exit grace period.
    pub fn with_force_exit_timeout(mut self, timeout: Duration) -> Self {
        self.force_exit_timeout = timeout;
        self
    }

    /// Builder: set the connection timeout.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Builder: set max connections per socket.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Builder: set the rescan retry policy.
    pub fn with_rescan_retry(mut self, policy: RescanRetryPolicy) -> Self {
        self.rescan_retry = policy;
        self
    }

    /// Builder: set the warm-up host.
    pub fn with_warm_up_host(mut self, host: impl Into<String>) -> Self {
        self.warm_up_host = host.into();
        self
    }

    /// Socket settings for a service socket.
    pub fn service_socket(&self, socket_path: PathBuf) -> SocketConfig {
        SocketConfig::new(socket_path)
            .with_connection_timeout(self.connection_timeout)
            .with_max_connections(self.max_connections)
            .with_mode(self.socket_mode)
    }

    /// Socket settings for the process control socket.
    pub fn control_socket(&self, socket_path: PathBuf) -> SocketConfig {
        self.service_socket(socket_path)
            .with_mode(self.control_socket_mode)
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self::new(DetectorPaths::default())
    }
}
