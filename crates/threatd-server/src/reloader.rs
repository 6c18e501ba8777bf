//! Reload indirection between the lifecycle and the current engine.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use crate::engine::{EngineError, ScanEngineFactory};

/// Errors of the reload protocol. None of them stop the daemon.
#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("no scan engine is bound to the reloader")]
    NoEngine,

    #[error("engine settings could not be read: {0}")]
    Settings(#[from] EngineError),

    #[error("live scan engine rejected the new settings")]
    ReloadRejected,
}

/// Forwards configuration reloads to the current scan engine.
pub trait Reloader: Send + Sync {
    /// Re-reads the engine settings. Returns whether anything that affects
    /// verdicts changed.
    fn update_config(&self) -> Result<bool, ReloadError>;

    /// Pushes the settings into the live engine.
    fn reload(&self) -> Result<(), ReloadError>;

    /// Rebinds the reloader to another engine.
    fn reset(&self, engine: Arc<dyn ScanEngineFactory>);
}

/// [`Reloader`] over a swappable engine reference.
#[derive(Default)]
pub struct EngineReloader {
    engine: RwLock<Option<Arc<dyn ScanEngineFactory>>>,
}

impl EngineReloader {
    pub fn new(engine: Arc<dyn ScanEngineFactory>) -> Self {
        Self {
            engine: RwLock::new(Some(engine)),
        }
    }

    /// A reloader with no engine yet; every operation fails until
    /// [`Reloader::reset`] binds one.
    pub fn unbound() -> Self {
        Self::default()
    }

    fn current(&self) -> Result<Arc<dyn ScanEngineFactory>, ReloadError> {
        self.engine.read().clone().ok_or(ReloadError::NoEngine)
    }
}

impl Reloader for EngineReloader {
    fn update_config(&self) -> Result<bool, ReloadError> {
        let changed = self.current()?.update_settings()?;
        debug!(changed, "Engine configuration updated");
        Ok(changed)
    }

    fn reload(&self) -> Result<(), ReloadError> {
        if self.current()?.reload() {
            Ok(())
        } else {
            Err(ReloadError::ReloadRejected)
        }
    }

    fn reset(&self, engine: Arc<dyn ScanEngineFactory>) {
        *self.engine.write() = Some(engine);
    }
}
