//! Daemon lifecycle: sandbox, event loop, workers and sockets.
//!
//! This crate provides the threat detector daemon that:
//! - Enters a chroot sandbox and drops its capabilities
//! - Serves scan, metadata rescan and process control requests over Unix sockets
//! - Restarts itself after an idle period or when asked to
//! - Re-synchronises caches and quarantine after settings changes
//!
//! # Example
//!
//! ```rust,no_run
//! use threatd_server::{DetectorConfig, ProductionResources, run_detector};
//!
//! let exit = run_detector(&ProductionResources, DetectorConfig::default());
//! std::process::exit(exit.code());
//! ```

mod config;
mod control;
mod detector;
mod engine;
mod error;
mod exit_code;
mod force_exit;
mod marker;
mod notify;
mod pidfile;
mod reloader;
mod reporter;
mod rescan;
mod resources;
mod sandbox;
mod scanning;
mod service;
mod shutdown_timer;
mod signals;
mod socket;
mod syscalls;

pub use config::{DetectorConfig, RescanRetryPolicy, SocketConfig};
pub use control::{ControlCallback, ControlClient, ControlHandler};
pub use detector::{DetectorControl, ThreatDetector, run_detector};
pub use engine::{
    BLOCKLIST_FILE, DigestEngineFactory, EngineDependencies, EngineError, EngineSettings,
    ScanEngineFactory, parse_blocklist, sha256_file,
};
pub use error::{ServerError, ServerResult};
pub use exit_code::{DetectorExit, run_guarded};
pub use force_exit::{DEFAULT_FORCE_EXIT_TIMEOUT, ExitAction, ForceExitTimer};
pub use marker::ExpectedShutdownMarker;
pub use notify::{UpdateCompleteNotifier, UpdateCompleteServer};
pub use pidfile::PidLock;
pub use reloader::{EngineReloader, ReloadError, Reloader};
pub use reporter::{SocketThreatReporter, ThreatReporter};
pub use rescan::{RescanClient, RescanOutcome, RescanTrigger, RescanWorker, StoppableSleep};
pub use resources::{DetectorResources, ProductionResources};
pub use sandbox::enter_sandbox;
pub use scanning::{MetadataRescanHandler, ScanningHandler};
pub use service::{RunningServices, ServiceThread};
pub use shutdown_timer::ShutdownTimer;
pub use signals::{NotifyPipe, ReloadMonitor, Reloadable, SignalMonitor, SignalPipeMonitor};
pub use socket::{ConnectionHandler, SocketServer};
pub use syscalls::{NixSystemCalls, SystemCalls};
