//! Daemon lifecycle: bootstrap, event loop and shutdown.

use std::os::fd::AsFd;
use std::sync::{Arc, OnceLock};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use threatd_core::ProxySettings;

use crate::config::DetectorConfig;
use crate::control::ControlCallback;
use crate::engine::{EngineDependencies, ScanEngineFactory};
use crate::error::{ServerError, ServerResult};
use crate::exit_code::{DetectorExit, run_guarded};
use crate::force_exit::ForceExitTimer;
use crate::marker::ExpectedShutdownMarker;
use crate::notify::UpdateCompleteNotifier;
use crate::reloader::{ReloadError, Reloader};
use crate::rescan::RescanTrigger;
use crate::resources::DetectorResources;
use crate::sandbox::enter_sandbox;
use crate::service::{RunningServices, ServiceThread};
use crate::shutdown_timer::ShutdownTimer;
use crate::signals::{NotifyPipe, Reloadable, SignalMonitor};
use crate::syscalls::SystemCalls;

/// Runs the daemon to completion and returns its exit status.
pub fn run_detector(resources: &dyn DetectorResources, config: DetectorConfig) -> DetectorExit {
    let exit = run_guarded(|| ThreatDetector::new(resources, config).run());
    info!(code = exit.code(), "Threat detector exiting");
    exit
}

/// Reload and shutdown entry points shared by SIGUSR1 and the control socket.
pub struct DetectorControl {
    reloader: Arc<dyn Reloader>,
    engine: Arc<dyn ScanEngineFactory>,
    notifier: Arc<dyn UpdateCompleteNotifier>,
    restart: Arc<NotifyPipe>,
    marker: ExpectedShutdownMarker,
    rescan: OnceLock<Arc<dyn RescanTrigger>>,
    reloading: Mutex<()>,
}

impl DetectorControl {
    pub fn new(
        reloader: Arc<dyn Reloader>,
        engine: Arc<dyn ScanEngineFactory>,
        notifier: Arc<dyn UpdateCompleteNotifier>,
        restart: Arc<NotifyPipe>,
        marker: ExpectedShutdownMarker,
    ) -> Self {
        Self {
            reloader,
            engine,
            notifier,
            restart,
            marker,
            rescan: OnceLock::new(),
            reloading: Mutex::new(()),
        }
    }

    /// Binds the rescan worker. Only the first binding counts.
    pub fn bind_rescan(&self, rescan: Arc<dyn RescanTrigger>) {
        if self.rescan.set(rescan).is_err() {
            warn!("Rescan worker already bound");
        }
    }

    /// Re-reads the settings, updates the live engine and, when verdicts may
    /// differ, invalidates client caches and requests a quarantine rescan.
    ///
    /// Returns whether the settings changed. Reloads are serialised.
    pub fn process_reload(&self) -> Result<bool, ReloadError> {
        let _reloading = self.reloading.lock();

        let changed = self.reloader.update_config()?;
        if self.engine.is_initialized() {
            self.reloader.reload()?;
        } else {
            debug!("Scan engine not initialised, nothing live to reload");
        }

        if changed {
            info!("Engine settings changed");
            self.notifier.update_complete();
            match self.rescan.get() {
                Some(rescan) => rescan.trigger_rescan(),
                None => warn!("Settings changed before the rescan worker started"),
            }
        }
        Ok(changed)
    }

    /// Asks the event loop for a quick restart.
    pub fn request_shutdown(&self) {
        self.marker.create();
        self.restart.notify();
    }
}

impl Reloadable for DetectorControl {
    fn reload(&self) {
        if let Err(e) = self.process_reload() {
            error!(error = %e, "Reload failed");
        }
    }
}

impl ControlCallback for DetectorControl {
    fn reload(&self) {
        Reloadable::reload(self);
    }

    fn shutdown(&self) {
        self.request_shutdown();
    }
}

const MIN_IDLE_WAIT_SECS: i64 = 1;

/// Inputs and state the event loop works on.
struct EventLoop<'a> {
    syscalls: &'a dyn SystemCalls,
    term: &'a dyn SignalMonitor,
    usr1: &'a dyn SignalMonitor,
    restart: &'a NotifyPipe,
    timer: &'a ShutdownTimer,
    engine: &'a dyn ScanEngineFactory,
    marker: &'a ExpectedShutdownMarker,
}

impl EventLoop<'_> {
    fn run(&self) -> DetectorExit {
        let failed = PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL;
        loop {
            let timeout = poll_timeout(self.remaining_idle_secs());
            let mut fds = [
                PollFd::new(self.term.as_fd(), PollFlags::POLLIN),
                PollFd::new(self.usr1.as_fd(), PollFlags::POLLIN),
                PollFd::new(self.restart.as_fd(), PollFlags::POLLIN),
            ];

            let ready = match self.syscalls.poll(&mut fds, timeout) {
                Ok(ready) => ready,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!(error = %e, "Event loop wait failed");
                    return DetectorExit::GenericFailure;
                }
            };

            if ready == 0 {
                if let Some(exit) = self.on_idle() {
                    return exit;
                }
                continue;
            }

            let [term, usr1, restart] =
                fds.map(|fd| fd.revents().unwrap_or_else(PollFlags::empty));

            if term.intersects(failed) {
                error!("Terminate monitor failed");
                return DetectorExit::GenericFailure;
            }
            if term.contains(PollFlags::POLLIN) && self.term.triggered() {
                info!("Terminate requested");
                return DetectorExit::CleanSuccess;
            }

            if usr1.intersects(failed) {
                error!("Reload monitor failed");
                return DetectorExit::GenericFailure;
            }
            if usr1.contains(PollFlags::POLLIN) {
                self.usr1.triggered();
                // one transition per wakeup; a pending restart is seen next poll
                continue;
            }

            if restart.intersects(failed) {
                error!("Restart trigger failed");
                return DetectorExit::GenericFailure;
            }
            if restart.contains(PollFlags::POLLIN) && self.restart.drain() {
                info!("Restart requested");
                self.marker.create();
                return DetectorExit::QuickRestart;
            }
        }
    }

    /// Seconds the next wait may block. An engine that never scanned cannot
    /// time out, so its wait never drops below [`MIN_IDLE_WAIT_SECS`].
    fn remaining_idle_secs(&self) -> i64 {
        let remaining = self.timer.timeout();
        if self.engine.is_initialized() {
            remaining
        } else {
            remaining.max(MIN_IDLE_WAIT_SECS)
        }
    }

    fn on_idle(&self) -> Option<DetectorExit> {
        if !self.engine.is_initialized() {
            // an engine that never scanned has nothing to release
            self.timer.reset();
            return None;
        }
        // a scan during the wait resets the timer
        if self.timer.timeout() > 0 {
            return None;
        }
        info!(
            idle_secs = self.timer.configured_timeout(),
            "Idle timeout reached, restarting"
        );
        self.marker.create();
        Some(DetectorExit::QuickRestart)
    }
}

fn poll_timeout(remaining_secs: i64) -> PollTimeout {
    if remaining_secs <= 0 {
        return PollTimeout::ZERO;
    }
    let millis = remaining_secs.saturating_mul(1000).min(i64::from(i32::MAX));
    i32::try_from(millis)
        .ok()
        .and_then(|ms| PollTimeout::try_from(ms).ok())
        .unwrap_or(PollTimeout::MAX)
}

/// The lifecycle state machine.
pub struct ThreatDetector<'r> {
    resources: &'r dyn DetectorResources,
    config: DetectorConfig,
}

impl<'r> ThreatDetector<'r> {
    pub fn new(resources: &'r dyn DetectorResources, config: DetectorConfig) -> Self {
        Self { resources, config }
    }

    /// Bootstraps the daemon, runs the event loop and shuts down.
    ///
    /// The construction order below is load-bearing.
    pub fn run(self) -> ServerResult<DetectorExit> {
        let resources = self.resources;
        let config = &self.config;

        // 1. system call wrapper
        let syscalls = resources.create_system_calls();

        // 2. watchdog, idle until armed at shutdown
        let watchdog = resources.create_force_exit_timer(config.force_exit_timeout);
        watchdog.start()?;

        // 3. terminate monitor and restart trigger
        let term = resources.create_sigterm_monitor()?;
        let restart = resources.create_restart_trigger()?;

        // 4. writes to closed peers must fail, not kill us
        syscalls
            .ignore_sigpipe()
            .map_err(|e| ServerError::system("Failed to ignore SIGPIPE", e))?;

        // 5. proxy, read before the host filesystem goes away
        let proxy = ProxySettings::load_best_effort(&config.paths.proxy_config());

        // 6. sandbox
        let paths = if config.sandbox {
            enter_sandbox(syscalls.as_ref(), &config.paths, &config.warm_up_host)?
        } else {
            debug!("Sandbox disabled");
            config.paths.clone()
        };

        // 7. stale marker
        let marker = ExpectedShutdownMarker::new(paths.expected_shutdown_marker());
        marker.remove();

        // 8. single instance
        let _pid_lock = resources.create_pid_lock(&paths.pid_file())?;

        // 9. engine dependencies
        let mut services = RunningServices::new();
        let reporter = resources.create_threat_reporter(&paths.threat_report_socket());
        let timer = resources.create_shutdown_timer(&paths.shutdown_timeout_config());
        let notifier = resources
            .create_update_complete_notifier(config.service_socket(paths.update_complete_socket()))?;
        services.start(Arc::new(notifier.clone()))?;

        // 10. engine, unless we are already asked to go
        let engine = resources.create_scan_engine_factory(
            &paths,
            EngineDependencies {
                reporter,
                shutdown_timer: timer.clone(),
                notifier: notifier.clone(),
                proxy,
            },
        );
        if term.triggered() {
            info!("Terminate requested during bootstrap");
            return Ok(shutdown(&watchdog, &mut services, None, DetectorExit::CleanSuccess));
        }

        // 11. initial engine data
        if !engine.update() {
            return Err(ServerError::EngineUpdate);
        }

        // 12. reload coordinator
        let reloader = resources.create_reloader(engine.clone());

        // 13. control socket, reachable only once the reloader exists
        let control = Arc::new(DetectorControl::new(
            reloader,
            engine.clone(),
            notifier.clone(),
            restart.clone(),
            marker.clone(),
        ));
        services.start(resources.create_control_server(
            config.control_socket(paths.control_socket()),
            control.clone(),
        )?)?;

        // 14. reload signal, before any scanning client can connect
        let usr1 = resources.create_usr1_monitor(control.clone())?;

        // 15. scanning, rescan worker, metadata rescan
        services.start(resources.create_scanning_server(
            config.service_socket(paths.scanning_socket()),
            engine.clone(),
        )?)?;
        let rescan = resources.create_rescan_worker(&paths, config.rescan_retry)?;
        services.start(Arc::new(rescan.clone()))?;
        control.bind_rescan(rescan);
        services.start(resources.create_metadata_rescan_server(
            config.service_socket(paths.metadata_rescan_socket()),
            engine.clone(),
        )?)?;

        // 16. deferred engine settings
        engine.load_settings_if_required();

        info!(services = services.len(), "Threat detector running");

        let exit = EventLoop {
            syscalls: syscalls.as_ref(),
            term: term.as_ref(),
            usr1: usr1.as_ref(),
            restart: &restart,
            timer: &timer,
            engine: engine.as_ref(),
            marker: &marker,
        }
        .run();

        Ok(shutdown(&watchdog, &mut services, Some(engine.as_ref()), exit))
    }
}

/// Stops everything under the watchdog.
fn shutdown(
    watchdog: &ForceExitTimer,
    services: &mut RunningServices,
    engine: Option<&dyn ScanEngineFactory>,
    exit: DetectorExit,
) -> DetectorExit {
    info!(code = exit.code(), "Shutting down");
    watchdog.set_exit_code(exit.code());
    watchdog.arm();

    services.stop_all();
    if let Some(engine) = engine {
        engine.shutdown();
    }

    watchdog.stop();
    exit
}
