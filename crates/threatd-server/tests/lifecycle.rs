//! Bootstrap and event loop driven through fake resources.

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollTimeout};
use parking_lot::Mutex;
use tempfile::{TempDir, tempdir};

use threatd_core::DetectorPaths;
use threatd_protocol::{
    MetadataRescanRequest, MetadataRescanResponse, ScanRequest, ScanResponse, ThreatReport,
    Verdict,
};
use threatd_server::{
    ControlCallback, DetectorConfig, DetectorControl, DetectorExit, DetectorResources,
    EngineDependencies, EngineError, EngineReloader, ExpectedShutdownMarker, ForceExitTimer,
    NotifyPipe, PidLock, ReloadError, ReloadMonitor, Reloadable, Reloader, RescanRetryPolicy,
    RescanTrigger, ScanEngineFactory, ServerResult, ServiceThread, ShutdownTimer, SignalMonitor,
    SocketConfig, SystemCalls, ThreatReporter, UpdateCompleteNotifier, run_detector,
};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeSystem {
    fail: Option<&'static str>,
    poll_errors: Mutex<VecDeque<Errno>>,
    polls: AtomicUsize,
}

impl FakeSystem {
    fn step(&self, name: &str) -> nix::Result<()> {
        if self.fail == Some(name) {
            Err(Errno::EPERM)
        } else {
            Ok(())
        }
    }
}

impl SystemCalls for FakeSystem {
    fn chroot(&self, _path: &Path) -> nix::Result<()> {
        self.step("chroot")
    }
    fn chdir(&self, _path: &Path) -> nix::Result<()> {
        self.step("chdir")
    }
    fn is_superuser(&self) -> bool {
        false
    }
    fn drop_capabilities(&self) -> nix::Result<()> {
        self.step("drop")
    }
    fn lock_capabilities(&self) -> nix::Result<()> {
        self.step("lock")
    }
    fn ignore_sigpipe(&self) -> nix::Result<()> {
        Ok(())
    }
    fn resolve_host(&self, _host: &str) -> io::Result<()> {
        Ok(())
    }
    fn poll(&self, fds: &mut [PollFd<'_>], timeout: PollTimeout) -> nix::Result<i32> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if let Some(errno) = self.poll_errors.lock().pop_front() {
            return Err(errno);
        }
        nix::poll::poll(fds, timeout)
    }
}

#[derive(Default)]
struct MockEngine {
    initialized: AtomicBool,
    update_fails: bool,
    settings_changed: AtomicBool,
    updates: AtomicUsize,
    reloads: AtomicUsize,
    deferred_loads: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl ScanEngineFactory for MockEngine {
    fn update(&self) -> bool {
        self.updates.fetch_add(1, Ordering::SeqCst);
        !self.update_fails
    }
    fn reload(&self) -> bool {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        true
    }
    fn update_settings(&self) -> Result<bool, EngineError> {
        Ok(self.settings_changed.load(Ordering::SeqCst))
    }
    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }
    fn load_settings_if_required(&self) {
        self.deferred_loads.fetch_add(1, Ordering::SeqCst);
    }
    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
    fn scan(&self, request: &ScanRequest) -> ScanResponse {
        ScanResponse {
            path: request.path.clone(),
            verdict: Verdict::Clean,
        }
    }
    fn rescan_metadata(&self, _request: &MetadataRescanRequest) -> MetadataRescanResponse {
        MetadataRescanResponse::NeedsFullScan
    }
}

/// A service thread that does nothing.
struct Idle;

impl ServiceThread for Idle {
    fn start(&self) -> ServerResult<()> {
        Ok(())
    }
    fn request_stop(&self) {}
    fn join(&self) {}
}

#[derive(Default)]
struct CountingNotifier {
    notices: AtomicUsize,
}

impl ServiceThread for CountingNotifier {
    fn start(&self) -> ServerResult<()> {
        Ok(())
    }
    fn request_stop(&self) {}
    fn join(&self) {}
}

impl UpdateCompleteNotifier for CountingNotifier {
    fn update_complete(&self) {
        self.notices.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct CountingRescan {
    triggers: AtomicUsize,
    stopped: AtomicBool,
}

impl ServiceThread for CountingRescan {
    fn start(&self) -> ServerResult<()> {
        Ok(())
    }
    fn request_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
    fn join(&self) {}
}

impl RescanTrigger for CountingRescan {
    fn trigger_rescan(&self) {
        self.triggers.fetch_add(1, Ordering::SeqCst);
    }
}

struct NoReports;

impl ThreatReporter for NoReports {
    fn send_threat_report(&self, _report: &ThreatReport) {}
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

struct Fixture {
    dir: TempDir,
    created: Mutex<Vec<&'static str>>,
    syscalls: Arc<FakeSystem>,
    term: Arc<NotifyPipe>,
    usr1: Arc<NotifyPipe>,
    restart: Arc<NotifyPipe>,
    watchdog: Arc<ForceExitTimer>,
    forced_exit: Arc<Mutex<Option<i32>>>,
    timer: Arc<ShutdownTimer>,
    engine: Arc<MockEngine>,
    notifier: Arc<CountingNotifier>,
    rescan: Arc<CountingRescan>,
    control: Mutex<Option<Arc<dyn ControlCallback>>>,
}

impl Fixture {
    fn new() -> Self {
        Self::build(FakeSystem::default(), MockEngine::default(), 3600)
    }

    fn build(syscalls: FakeSystem, engine: MockEngine, idle_timeout: i64) -> Self {
        let forced_exit = Arc::new(Mutex::new(None));
        let recorded = forced_exit.clone();
        let watchdog = ForceExitTimer::with_exit_action(
            Duration::from_secs(10),
            Arc::new(move |code: i32| *recorded.lock() = Some(code)),
        );
        Self {
            dir: tempdir().unwrap(),
            created: Mutex::new(Vec::new()),
            syscalls: Arc::new(syscalls),
            term: Arc::new(NotifyPipe::new().unwrap()),
            usr1: Arc::new(NotifyPipe::new().unwrap()),
            restart: Arc::new(NotifyPipe::new().unwrap()),
            watchdog: Arc::new(watchdog),
            forced_exit,
            timer: Arc::new(ShutdownTimer::with_timeout(idle_timeout)),
            engine: Arc::new(engine),
            notifier: Arc::new(CountingNotifier::default()),
            rescan: Arc::new(CountingRescan::default()),
            control: Mutex::new(None),
        }
    }

    fn paths(&self) -> DetectorPaths {
        DetectorPaths::new(self.dir.path())
    }

    fn config(&self) -> DetectorConfig {
        DetectorConfig::new(self.paths()).with_sandbox(false)
    }

    fn marker(&self) -> ExpectedShutdownMarker {
        ExpectedShutdownMarker::new(self.paths().expected_shutdown_marker())
    }

    fn record(&self, name: &'static str) {
        self.created.lock().push(name);
    }

    fn bootstrapped(&self) -> bool {
        self.engine.deferred_loads.load(Ordering::SeqCst) > 0
    }

    fn control(&self) -> Arc<dyn ControlCallback> {
        self.control.lock().clone().expect("control server not created")
    }
}

impl DetectorResources for Fixture {
    fn create_system_calls(&self) -> Arc<dyn SystemCalls> {
        self.record("system_calls");
        self.syscalls.clone()
    }

    fn create_force_exit_timer(&self, _timeout: Duration) -> Arc<ForceExitTimer> {
        self.record("force_exit");
        self.watchdog.clone()
    }

    fn create_sigterm_monitor(&self) -> ServerResult<Box<dyn SignalMonitor>> {
        self.record("sigterm");
        Ok(Box::new(self.term.clone()))
    }

    fn create_usr1_monitor(
        &self,
        target: Arc<dyn Reloadable>,
    ) -> ServerResult<Box<dyn SignalMonitor>> {
        self.record("usr1");
        Ok(Box::new(ReloadMonitor::new(
            Box::new(self.usr1.clone()),
            target,
        )))
    }

    fn create_restart_trigger(&self) -> ServerResult<Arc<NotifyPipe>> {
        self.record("restart");
        Ok(self.restart.clone())
    }

    fn create_pid_lock(&self, path: &Path) -> ServerResult<PidLock> {
        self.record("pid_lock");
        PidLock::acquire(path)
    }

    fn create_threat_reporter(&self, _socket_path: &Path) -> Arc<dyn ThreatReporter> {
        self.record("reporter");
        Arc::new(NoReports)
    }

    fn create_shutdown_timer(&self, _config_path: &Path) -> Arc<ShutdownTimer> {
        self.record("shutdown_timer");
        self.timer.clone()
    }

    fn create_update_complete_notifier(
        &self,
        _config: SocketConfig,
    ) -> ServerResult<Arc<dyn UpdateCompleteNotifier>> {
        self.record("notifier");
        Ok(self.notifier.clone())
    }

    fn create_scan_engine_factory(
        &self,
        _paths: &DetectorPaths,
        _deps: EngineDependencies,
    ) -> Arc<dyn ScanEngineFactory> {
        self.record("engine");
        self.engine.clone()
    }

    fn create_reloader(&self, engine: Arc<dyn ScanEngineFactory>) -> Arc<dyn Reloader> {
        self.record("reloader");
        Arc::new(EngineReloader::new(engine))
    }

    fn create_control_server(
        &self,
        _config: SocketConfig,
        callback: Arc<dyn ControlCallback>,
    ) -> ServerResult<Arc<dyn ServiceThread>> {
        self.record("control");
        *self.control.lock() = Some(callback);
        Ok(Arc::new(Idle))
    }

    fn create_scanning_server(
        &self,
        _config: SocketConfig,
        _engine: Arc<dyn ScanEngineFactory>,
    ) -> ServerResult<Arc<dyn ServiceThread>> {
        self.record("scanning");
        Ok(Arc::new(Idle))
    }

    fn create_metadata_rescan_server(
        &self,
        _config: SocketConfig,
        _engine: Arc<dyn ScanEngineFactory>,
    ) -> ServerResult<Arc<dyn ServiceThread>> {
        self.record("metadata");
        Ok(Arc::new(Idle))
    }

    fn create_rescan_worker(
        &self,
        _paths: &DetectorPaths,
        _retry: RescanRetryPolicy,
    ) -> ServerResult<Arc<dyn RescanTrigger>> {
        self.record("rescan_worker");
        Ok(self.rescan.clone())
    }
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Runs the detector on a thread while `drive` interacts with it.
fn run_driven(fixture: &Fixture, drive: impl FnOnce(&Fixture)) -> DetectorExit {
    let config = fixture.config();
    thread::scope(|s| {
        let detector = s.spawn(|| run_detector(fixture, config));
        wait_until("bootstrap", || fixture.bootstrapped() || detector.is_finished());
        drive(fixture);
        detector.join().unwrap()
    })
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

#[test]
fn bootstrap_builds_in_dependency_order() {
    let fixture = Fixture::new();
    fixture.restart.notify();

    let exit = run_detector(&fixture, fixture.config());

    assert_eq!(exit, DetectorExit::QuickRestart);
    assert_eq!(
        *fixture.created.lock(),
        [
            "system_calls",
            "force_exit",
            "sigterm",
            "restart",
            "pid_lock",
            "reporter",
            "shutdown_timer",
            "notifier",
            "engine",
            "reloader",
            "control",
            "usr1",
            "scanning",
            "rescan_worker",
            "metadata",
        ]
    );
    assert_eq!(fixture.engine.updates.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.engine.deferred_loads.load(Ordering::SeqCst), 1);
}

#[test]
fn terminate_during_bootstrap_skips_engine_initialisation() {
    let fixture = Fixture::new();
    fixture.term.notify();

    let exit = run_detector(&fixture, fixture.config());

    assert_eq!(exit, DetectorExit::CleanSuccess);
    assert_eq!(fixture.engine.updates.load(Ordering::SeqCst), 0);
    assert!(!fixture.engine.is_initialized());
    assert!(!fixture.created.lock().contains(&"reloader"));
    assert!(!fixture.marker().exists());
}

#[test]
fn failed_initial_update_has_its_own_exit_code() {
    let fixture = Fixture::build(
        FakeSystem::default(),
        MockEngine {
            update_fails: true,
            ..Default::default()
        },
        3600,
    );

    let exit = run_detector(&fixture, fixture.config());

    assert_eq!(exit, DetectorExit::EngineUpdateFailed);
    assert_eq!(exit.code(), 34);
    assert!(!fixture.created.lock().contains(&"control"));
}

#[test]
fn sandbox_failures_map_to_distinct_exit_codes() {
    let cases = [
        ("chroot", DetectorExit::SandboxEntryFailed),
        ("drop", DetectorExit::CapabilityDropFailed),
        ("lock", DetectorExit::CapabilityLockFailed),
        ("chdir", DetectorExit::ChangeDirectoryFailed),
    ];

    let mut codes = Vec::new();
    for (step, expected) in cases {
        let fixture = Fixture::build(
            FakeSystem {
                fail: Some(step),
                ..Default::default()
            },
            MockEngine::default(),
            3600,
        );
        let exit = run_detector(&fixture, fixture.config().with_sandbox(true));
        assert_eq!(exit, expected, "failing step {step}");
        assert!(!fixture.created.lock().contains(&"pid_lock"));
        codes.push(exit.code());
    }

    codes.push(DetectorExit::EngineUpdateFailed.code());
    let mut unique = codes.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), codes.len());
}

#[test]
fn held_pid_lock_is_a_runtime_error() {
    let fixture = Fixture::new();
    let _held = PidLock::acquire(fixture.paths().pid_file()).unwrap();

    let exit = run_detector(&fixture, fixture.config());

    assert_eq!(exit, DetectorExit::RuntimeError);
    assert!(!fixture.created.lock().contains(&"engine"));
}

#[test]
fn stale_marker_is_removed_at_startup() {
    let fixture = Fixture::new();
    let marker = fixture.marker();
    std::fs::create_dir_all(marker.path().parent().unwrap()).unwrap();
    marker.create();
    fixture.term.notify();

    run_detector(&fixture, fixture.config());

    assert!(!marker.exists());
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

#[test]
fn idle_timeout_with_initialised_engine_restarts() {
    for timeout in [0, -1, -3600] {
        let engine = MockEngine::default();
        engine.initialized.store(true, Ordering::SeqCst);
        let fixture = Fixture::build(FakeSystem::default(), engine, timeout);

        let exit = run_detector(&fixture, fixture.config());

        assert_eq!(exit, DetectorExit::QuickRestart, "timeout {timeout}");
        assert!(fixture.marker().exists());
        assert_eq!(fixture.watchdog.exit_code(), 77);
    }
}

#[test]
fn idle_timeout_without_engine_keeps_running() {
    let fixture = Fixture::build(FakeSystem::default(), MockEngine::default(), 0);
    let config = fixture.config();

    let exit = thread::scope(|s| {
        let detector = s.spawn(|| run_detector(&fixture, config));
        wait_until("bootstrap", || fixture.bootstrapped());
        let polls_before = fixture.syscalls.polls.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(500));
        assert!(!detector.is_finished());
        // the loop blocks instead of spinning on a zero timeout
        let polls = fixture.syscalls.polls.load(Ordering::SeqCst) - polls_before;
        assert!(polls <= 2, "{polls} waits in 500ms");
        fixture.term.notify();
        detector.join().unwrap()
    });

    assert_eq!(exit, DetectorExit::CleanSuccess);
    assert!(!fixture.marker().exists());
}

#[test]
fn reload_and_restart_together_take_two_wakeups() {
    let engine = MockEngine::default();
    engine.initialized.store(true, Ordering::SeqCst);
    engine.settings_changed.store(true, Ordering::SeqCst);
    let fixture = Fixture::build(FakeSystem::default(), engine, 3600);
    fixture.usr1.notify();
    fixture.restart.notify();

    let exit = run_detector(&fixture, fixture.config());

    assert_eq!(exit, DetectorExit::QuickRestart);
    assert_eq!(fixture.syscalls.polls.load(Ordering::SeqCst), 2);
    assert_eq!(fixture.engine.reloads.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.notifier.notices.load(Ordering::SeqCst), 1);
    assert!(fixture.marker().exists());
}

#[test]
fn terminate_is_a_clean_exit() {
    let fixture = Fixture::new();
    let exit = run_driven(&fixture, |f| {
        f.term.notify();
        f.term.notify();
    });

    assert_eq!(exit, DetectorExit::CleanSuccess);
    assert_eq!(fixture.engine.shutdowns.load(Ordering::SeqCst), 1);
    assert!(fixture.rescan.stopped.load(Ordering::SeqCst));
    assert!(fixture.forced_exit.lock().is_none());
    assert_eq!(fixture.watchdog.exit_code(), 0);
}

#[test]
fn restart_trigger_is_a_quick_restart() {
    let fixture = Fixture::new();
    let exit = run_driven(&fixture, |f| f.restart.notify());

    assert_eq!(exit, DetectorExit::QuickRestart);
    assert!(fixture.marker().exists());
}

#[test]
fn control_shutdown_is_a_quick_restart() {
    let fixture = Fixture::new();
    let exit = run_driven(&fixture, |f| f.control().shutdown());

    assert_eq!(exit, DetectorExit::QuickRestart);
    assert!(fixture.marker().exists());
    assert!(fixture.forced_exit.lock().is_none());
}

#[test]
fn interrupted_wait_is_retried() {
    let fixture = Fixture::build(FakeSystem::default(), MockEngine::default(), 3600);
    fixture
        .syscalls
        .poll_errors
        .lock()
        .extend([Errno::EINTR, Errno::EINTR]);
    fixture.restart.notify();

    let exit = run_detector(&fixture, fixture.config());

    assert_eq!(exit, DetectorExit::QuickRestart);
    assert!(fixture.syscalls.poll_errors.lock().is_empty());
}

#[test]
fn other_wait_errors_are_generic_failures() {
    let fixture = Fixture::new();
    fixture.syscalls.poll_errors.lock().push_back(Errno::EBADF);

    let exit = run_detector(&fixture, fixture.config());

    assert_eq!(exit, DetectorExit::GenericFailure);
    assert_eq!(exit.code(), 1);
    assert_eq!(fixture.engine.shutdowns.load(Ordering::SeqCst), 1);
    assert!(!fixture.marker().exists());
}

#[test]
fn reload_signal_runs_reload_and_keeps_looping() {
    let fixture = Fixture::new();
    fixture.engine.initialized.store(true, Ordering::SeqCst);
    fixture.engine.settings_changed.store(true, Ordering::SeqCst);

    let exit = run_driven(&fixture, |f| {
        f.usr1.notify();
        wait_until("rescan trigger", || f.rescan.triggers.load(Ordering::SeqCst) == 1);
        f.term.notify();
    });

    assert_eq!(exit, DetectorExit::CleanSuccess);
    assert_eq!(fixture.notifier.notices.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.engine.reloads.load(Ordering::SeqCst), 1);
}

#[test]
fn control_reload_runs_reload() {
    let fixture = Fixture::new();
    fixture.engine.settings_changed.store(true, Ordering::SeqCst);

    let exit = run_driven(&fixture, |f| {
        f.control().reload();
        f.term.notify();
    });

    assert_eq!(exit, DetectorExit::CleanSuccess);
    assert_eq!(fixture.rescan.triggers.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Reload protocol
// ---------------------------------------------------------------------------

struct ReloadCase {
    engine: Arc<MockEngine>,
    notifier: Arc<CountingNotifier>,
    rescan: Arc<CountingRescan>,
    control: DetectorControl,
    _dir: TempDir,
}

fn reload_case(bound: bool, changed: bool, initialized: bool) -> ReloadCase {
    let dir = tempdir().unwrap();
    let engine = Arc::new(MockEngine::default());
    engine.settings_changed.store(changed, Ordering::SeqCst);
    engine.initialized.store(initialized, Ordering::SeqCst);
    let reloader: Arc<dyn Reloader> = if bound {
        Arc::new(EngineReloader::new(engine.clone()))
    } else {
        Arc::new(EngineReloader::unbound())
    };
    let notifier = Arc::new(CountingNotifier::default());
    let rescan = Arc::new(CountingRescan::default());
    let control = DetectorControl::new(
        reloader,
        engine.clone(),
        notifier.clone(),
        Arc::new(NotifyPipe::new().unwrap()),
        ExpectedShutdownMarker::new(dir.path().join("marker")),
    );
    control.bind_rescan(rescan.clone());
    ReloadCase {
        engine,
        notifier,
        rescan,
        control,
        _dir: dir,
    }
}

impl ReloadCase {
    fn counts(&self) -> (usize, usize, usize) {
        (
            self.engine.reloads.load(Ordering::SeqCst),
            self.notifier.notices.load(Ordering::SeqCst),
            self.rescan.triggers.load(Ordering::SeqCst),
        )
    }
}

#[test]
fn changed_settings_with_live_engine_notify_and_rescan_once() {
    let case = reload_case(true, true, true);
    assert!(case.control.process_reload().unwrap());
    assert_eq!(case.counts(), (1, 1, 1));
}

#[test]
fn unchanged_settings_notify_nobody() {
    let case = reload_case(true, false, true);
    assert!(!case.control.process_reload().unwrap());
    assert_eq!(case.counts(), (1, 0, 0));
}

#[test]
fn changed_settings_without_live_engine_still_rescan() {
    let case = reload_case(true, true, false);
    assert!(case.control.process_reload().unwrap());
    assert_eq!(case.counts(), (0, 1, 1));
}

#[test]
fn reload_without_engine_is_contained() {
    let case = reload_case(false, true, true);
    assert!(matches!(
        case.control.process_reload(),
        Err(ReloadError::NoEngine)
    ));
    // the signal path logs and carries on
    Reloadable::reload(&case.control);
    assert_eq!(case.counts(), (0, 0, 0));
}

#[test]
fn changed_settings_before_rescan_worker_are_not_fatal() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(MockEngine::default());
    engine.settings_changed.store(true, Ordering::SeqCst);
    let notifier = Arc::new(CountingNotifier::default());
    let control = DetectorControl::new(
        Arc::new(EngineReloader::new(engine.clone())),
        engine,
        notifier.clone(),
        Arc::new(NotifyPipe::new().unwrap()),
        ExpectedShutdownMarker::new(dir.path().join("marker")),
    );

    assert!(control.process_reload().unwrap());
    assert_eq!(notifier.notices.load(Ordering::SeqCst), 1);
}

#[test]
fn shutdown_request_marks_and_triggers_restart() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(MockEngine::default());
    let restart = Arc::new(NotifyPipe::new().unwrap());
    let marker = ExpectedShutdownMarker::new(dir.path().join("marker"));
    let control = DetectorControl::new(
        Arc::new(EngineReloader::new(engine.clone())),
        engine,
        Arc::new(CountingNotifier::default()),
        restart.clone(),
        marker.clone(),
    );

    ControlCallback::shutdown(&control);

    assert!(marker.exists());
    assert!(restart.drain());
}
