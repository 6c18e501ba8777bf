//! Core types: install layout, best-effort config readers, tracing setup

pub mod config;
pub mod paths;
pub mod tracing;

pub use config::{
    DEFAULT_RESCAN_INTERVAL_SECS, DEFAULT_SHUTDOWN_TIMEOUT_SECS, ProxySettings,
    ShutdownTimeoutConfig, read_rescan_interval,
};
pub use paths::{DetectorPaths, default_install_root};
pub use tracing::{TracingConfig, TracingError, TracingOutputFormat, init_tracing};
