//! Resource factory.
//!
//! The lifecycle never constructs a collaborator itself: every signal
//! monitor, socket, worker and engine comes from a [`DetectorResources`].
//! [`ProductionResources`] builds the real ones; tests substitute fakes.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use threatd_core::DetectorPaths;

use crate::config::{RescanRetryPolicy, SocketConfig};
use crate::control::{ControlCallback, ControlHandler};
use crate::engine::{DigestEngineFactory, EngineDependencies, ScanEngineFactory};
use crate::error::ServerResult;
use crate::force_exit::ForceExitTimer;
use crate::notify::{UpdateCompleteNotifier, UpdateCompleteServer};
use crate::pidfile::PidLock;
use crate::reloader::{EngineReloader, Reloader};
use crate::reporter::{SocketThreatReporter, ThreatReporter};
use crate::rescan::{RescanTrigger, RescanWorker};
use crate::scanning::{MetadataRescanHandler, ScanningHandler};
use crate::service::ServiceThread;
use crate::shutdown_timer::ShutdownTimer;
use crate::signals::{NotifyPipe, Reloadable, ReloadMonitor, SignalMonitor, SignalPipeMonitor};
use crate::socket::SocketServer;
use crate::syscalls::{NixSystemCalls, SystemCalls};

/// Builds every stateful collaborator of the daemon.
pub trait DetectorResources: Send + Sync {
    fn create_system_calls(&self) -> Arc<dyn SystemCalls>;

    fn create_force_exit_timer(&self, timeout: Duration) -> Arc<ForceExitTimer>;

    fn create_sigterm_monitor(&self) -> ServerResult<Box<dyn SignalMonitor>>;

    /// Monitor that runs `target.reload()` each time it fires.
    fn create_usr1_monitor(
        &self,
        target: Arc<dyn Reloadable>,
    ) -> ServerResult<Box<dyn SignalMonitor>>;

    /// Channel asking the event loop for a quick restart.
    fn create_restart_trigger(&self) -> ServerResult<Arc<NotifyPipe>>;

    fn create_pid_lock(&self, path: &Path) -> ServerResult<PidLock>;

    fn create_threat_reporter(&self, socket_path: &Path) -> Arc<dyn ThreatReporter>;

    fn create_shutdown_timer(&self, config_path: &Path) -> Arc<ShutdownTimer>;

    fn create_update_complete_notifier(
        &self,
        config: SocketConfig,
    ) -> ServerResult<Arc<dyn UpdateCompleteNotifier>>;

    fn create_scan_engine_factory(
        &self,
        paths: &DetectorPaths,
        deps: EngineDependencies,
    ) -> Arc<dyn ScanEngineFactory>;

    fn create_reloader(&self, engine: Arc<dyn ScanEngineFactory>) -> Arc<dyn Reloader>;

    fn create_control_server(
        &self,
        config: SocketConfig,
        callback: Arc<dyn ControlCallback>,
    ) -> ServerResult<Arc<dyn ServiceThread>>;

    fn create_scanning_server(
        &self,
        config: SocketConfig,
        engine: Arc<dyn ScanEngineFactory>,
    ) -> ServerResult<Arc<dyn ServiceThread>>;

    fn create_metadata_rescan_server(
        &self,
        config: SocketConfig,
        engine: Arc<dyn ScanEngineFactory>,
    ) -> ServerResult<Arc<dyn ServiceThread>>;

    fn create_rescan_worker(
        &self,
        paths: &DetectorPaths,
        retry: RescanRetryPolicy,
    ) -> ServerResult<Arc<dyn RescanTrigger>>;
}

/// The real collaborators.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProductionResources;

impl DetectorResources for ProductionResources {
    fn create_system_calls(&self) -> Arc<dyn SystemCalls> {
        Arc::new(NixSystemCalls)
    }

    fn create_force_exit_timer(&self, timeout: Duration) -> Arc<ForceExitTimer> {
        Arc::new(ForceExitTimer::new(timeout))
    }

    fn create_sigterm_monitor(&self) -> ServerResult<Box<dyn SignalMonitor>> {
        Ok(Box::new(SignalPipeMonitor::terminate()?))
    }

    fn create_usr1_monitor(
        &self,
        target: Arc<dyn Reloadable>,
    ) -> ServerResult<Box<dyn SignalMonitor>> {
        Ok(Box::new(ReloadMonitor::usr1(target)?))
    }

    fn create_restart_trigger(&self) -> ServerResult<Arc<NotifyPipe>> {
        Ok(Arc::new(NotifyPipe::new()?))
    }

    fn create_pid_lock(&self, path: &Path) -> ServerResult<PidLock> {
        PidLock::acquire(path)
    }

    fn create_threat_reporter(&self, socket_path: &Path) -> Arc<dyn ThreatReporter> {
        Arc::new(SocketThreatReporter::new(socket_path))
    }

    fn create_shutdown_timer(&self, config_path: &Path) -> Arc<ShutdownTimer> {
        Arc::new(ShutdownTimer::new(config_path))
    }

    fn create_update_complete_notifier(
        &self,
        config: SocketConfig,
    ) -> ServerResult<Arc<dyn UpdateCompleteNotifier>> {
        Ok(Arc::new(UpdateCompleteServer::bind(config)?))
    }

    fn create_scan_engine_factory(
        &self,
        paths: &DetectorPaths,
        deps: EngineDependencies,
    ) -> Arc<dyn ScanEngineFactory> {
        Arc::new(DigestEngineFactory::new(
            paths.engine_settings(),
            paths.engine_data_dir(),
            deps,
        ))
    }

    fn create_reloader(&self, engine: Arc<dyn ScanEngineFactory>) -> Arc<dyn Reloader> {
        Arc::new(EngineReloader::new(engine))
    }

    fn create_control_server(
        &self,
        config: SocketConfig,
        callback: Arc<dyn ControlCallback>,
    ) -> ServerResult<Arc<dyn ServiceThread>> {
        let handler = Arc::new(ControlHandler::new(callback));
        Ok(Arc::new(SocketServer::bind("control", config, handler)?))
    }

    fn create_scanning_server(
        &self,
        config: SocketConfig,
        engine: Arc<dyn ScanEngineFactory>,
    ) -> ServerResult<Arc<dyn ServiceThread>> {
        let handler = Arc::new(ScanningHandler::new(engine));
        Ok(Arc::new(SocketServer::bind("scanning", config, handler)?))
    }

    fn create_metadata_rescan_server(
        &self,
        config: SocketConfig,
        engine: Arc<dyn ScanEngineFactory>,
    ) -> ServerResult<Arc<dyn ServiceThread>> {
        let handler = Arc::new(MetadataRescanHandler::new(engine));
        Ok(Arc::new(SocketServer::bind("metadata-rescan", config, handler)?))
    }

    fn create_rescan_worker(
        &self,
        paths: &DetectorPaths,
        retry: RescanRetryPolicy,
    ) -> ServerResult<Arc<dyn RescanTrigger>> {
        Ok(Arc::new(RescanWorker::new(
            &paths.rescan_service_socket(),
            &paths.rescan_interval_config(),
            retry,
        )))
    }
}
