//! Idle shutdown timer.

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use threatd_core::ShutdownTimeoutConfig;

/// Tracks the time since the last scan and how much idle time is left
/// before the daemon restarts itself to release memory.
///
/// Scan threads call [`reset`](Self::reset) concurrently; the event loop
/// reads [`timeout`](Self::timeout).
#[derive(Debug)]
pub struct ShutdownTimer {
    last_activity: AtomicI64,
    timeout_secs: i64,
}

fn epoch_secs() -> i64 {
    Utc::now().timestamp()
}

impl ShutdownTimer {
    /// Reads the threshold from the idle shutdown config, once.
    pub fn new(config_path: &Path) -> Self {
        Self::with_timeout(ShutdownTimeoutConfig::load_or_default(config_path).shutdown_timeout)
    }

    pub fn with_timeout(timeout_secs: i64) -> Self {
        Self {
            last_activity: AtomicI64::new(epoch_secs()),
            timeout_secs,
        }
    }

    /// Records scan activity now.
    pub fn reset(&self) {
        self.last_activity.store(epoch_secs(), Ordering::Relaxed);
    }

    /// Seconds of idle time left. Zero or negative once the threshold passed.
    pub fn timeout(&self) -> i64 {
        let idle = epoch_secs() - self.last_activity.load(Ordering::Relaxed);
        self.timeout_secs - idle
    }

    pub fn configured_timeout(&self) -> i64 {
        self.timeout_secs
    }
}
