//! Force-exit watchdog.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use crate::error::ServerResult;
use crate::service::{ServiceThread, join_handle, spawn_named};

/// Grace period for an orderly shutdown.
pub const DEFAULT_FORCE_EXIT_TIMEOUT: Duration = Duration::from_secs(10);

const THREAD_NAME: &str = "force-exit";

/// What the watchdog does when the grace period runs out.
pub type ExitAction = Arc<dyn Fn(i32) + Send + Sync>;

#[derive(Default)]
struct WatchdogState {
    armed: bool,
    stopped: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<WatchdogState>,
    cond: Condvar,
    exit_code: AtomicI32,
}

fn terminate(code: i32) {
    // SAFETY: _exit(2) takes no pointers and never returns; skipping Rust
    // destructors and atexit handlers is the intended effect.
    unsafe { libc::_exit(code) }
}

/// Bounds how long a graceful shutdown may take.
///
/// The thread starts idle. Once [`arm`](Self::arm)ed it waits for a stop
/// request for at most the grace period; if none arrives it terminates the
/// process with the code set through [`set_exit_code`](Self::set_exit_code).
///
/// The default action is `_exit(2)`: no destructors run, no stack unwinds,
/// buffered output that was not flushed is lost. A hung worker can therefore
/// never keep the process alive past the grace period.
pub struct ForceExitTimer {
    shared: Arc<Shared>,
    timeout: Duration,
    exit_action: ExitAction,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ForceExitTimer {
    pub fn new(timeout: Duration) -> Self {
        Self::with_exit_action(timeout, Arc::new(terminate))
    }

    pub fn with_exit_action(timeout: Duration, exit_action: ExitAction) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            timeout,
            exit_action,
            handle: Mutex::new(None),
        }
    }

    pub fn set_exit_code(&self, code: i32) {
        self.shared.exit_code.store(code, Ordering::SeqCst);
    }

    pub fn exit_code(&self) -> i32 {
        self.shared.exit_code.load(Ordering::SeqCst)
    }

    /// Starts the countdown.
    pub fn arm(&self) {
        let mut state = self.shared.state.lock();
        state.armed = true;
        self.shared.cond.notify_all();
        info!(
            timeout_ms = self.timeout.as_millis() as u64,
            code = self.exit_code(),
            "Force-exit watchdog armed"
        );
    }

    fn watch(shared: Arc<Shared>, timeout: Duration, exit_action: ExitAction) {
        let mut state = shared.state.lock();
        shared
            .cond
            .wait_while(&mut state, |s| !s.armed && !s.stopped);
        if state.stopped {
            debug!("Force-exit watchdog stopped before arming");
            return;
        }

        let result = shared.cond.wait_while_for(&mut state, |s| !s.stopped, timeout);
        if !result.timed_out() || state.stopped {
            debug!("Shutdown finished within the grace period");
            return;
        }
        drop(state);

        let code = shared.exit_code.load(Ordering::SeqCst);
        error!(code, "Shutdown did not finish in time, forcing exit");
        exit_action(code);
    }
}

impl ServiceThread for ForceExitTimer {
    fn start(&self) -> ServerResult<()> {
        let mut slot = self.handle.lock();
        if slot.is_some() {
            return Ok(());
        }
        let shared = self.shared.clone();
        let timeout = self.timeout;
        let exit_action = self.exit_action.clone();
        *slot = Some(spawn_named(THREAD_NAME, move || {
            Self::watch(shared, timeout, exit_action)
        })?);
        Ok(())
    }

    fn request_stop(&self) {
        let mut state = self.shared.state.lock();
        state.stopped = true;
        self.shared.cond.notify_all();
    }

    fn join(&self) {
        let handle = self.handle.lock().take();
        join_handle(THREAD_NAME, handle);
    }
}

impl Drop for ForceExitTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
