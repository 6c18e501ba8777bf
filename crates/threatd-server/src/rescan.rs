//! Quarantine rescan worker.
//!
//! Items held in quarantine were judged with the engine data and settings of
//! their day. The worker periodically, and right after every settings change,
//! asks the quarantine store's rescan service to re-evaluate them.

use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use threatd_protocol::{FrameWriter, RescanRequest};

use crate::config::RescanRetryPolicy;
use crate::error::ServerResult;
use crate::service::{ServiceThread, join_handle, spawn_named};

const THREAD_NAME: &str = "rescan-worker";

/// A sleep that ends early when a stop is requested.
pub trait StoppableSleep: Send + Sync {
    /// Sleeps up to `duration`. Returns true if it ended because of a stop.
    fn sleep(&self, duration: Duration) -> bool;
}

/// A service that can be asked for an immediate rescan.
pub trait RescanTrigger: ServiceThread {
    /// Requests a rescan now. Never blocks.
    fn trigger_rescan(&self);
}

/// How a rescan request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescanOutcome {
    Sent,
    /// Stop was requested while retrying.
    Stopped,
    /// The service never accepted a connection.
    Unreachable,
}

/// Sends rescan requests to the rescan service.
#[derive(Debug, Clone)]
pub struct RescanClient {
    socket_path: PathBuf,
    retry: RescanRetryPolicy,
}

impl RescanClient {
    pub fn new(socket_path: impl Into<PathBuf>, retry: RescanRetryPolicy) -> Self {
        Self {
            socket_path: socket_path.into(),
            retry,
        }
    }

    /// Connects, retrying through `sleep`, and sends one request.
    pub fn request_rescan(&self, sleep: &dyn StoppableSleep) -> RescanOutcome {
        let attempts = self.retry.attempts.max(1);
        for attempt in 1..=attempts {
            match self.send() {
                Ok(()) => {
                    info!("Requested quarantine rescan");
                    return RescanOutcome::Sent;
                }
                Err(e) => debug!(attempt, error = %e, "Rescan service not reachable"),
            }
            if attempt < attempts && sleep.sleep(self.retry.delay) {
                debug!("Rescan request abandoned, stopping");
                return RescanOutcome::Stopped;
            }
        }
        warn!(
            socket = %self.socket_path.display(),
            attempts,
            "Giving up on rescan request"
        );
        RescanOutcome::Unreachable
    }

    fn send(&self) -> ServerResult<()> {
        let stream = UnixStream::connect(&self.socket_path)?;
        stream.set_write_timeout(Some(Duration::from_secs(5)))?;
        FrameWriter::new(&stream).write_message(&RescanRequest::now())?;
        Ok(())
    }
}

#[derive(Default)]
struct RescanState {
    manual: bool,
    stop: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<RescanState>,
    cond: Condvar,
}

impl StoppableSleep for Shared {
    fn sleep(&self, duration: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.stop {
            self.cond.wait_while_for(&mut state, |s| !s.stop, duration);
        }
        state.stop
    }
}

/// Background thread requesting rescans every interval and on demand.
pub struct RescanWorker {
    client: RescanClient,
    interval: Duration,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RescanWorker {
    /// Reads the interval from `interval_path`, once.
    pub fn new(socket_path: &Path, interval_path: &Path, retry: RescanRetryPolicy) -> Self {
        Self::with_interval(
            socket_path,
            threatd_core::read_rescan_interval(interval_path),
            retry,
        )
    }

    pub fn with_interval(socket_path: &Path, interval: Duration, retry: RescanRetryPolicy) -> Self {
        Self {
            client: RescanClient::new(socket_path, retry),
            interval,
            shared: Arc::new(Shared::default()),
            handle: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn run(client: RescanClient, interval: Duration, shared: Arc<Shared>) {
        debug!(interval_secs = interval.as_secs(), "Rescan worker started");
        loop {
            let manual = {
                let mut state = shared.state.lock();
                shared
                    .cond
                    .wait_while_for(&mut state, |s| !s.manual && !s.stop, interval);
                if state.stop {
                    break;
                }
                std::mem::take(&mut state.manual)
            };

            debug!(manual, "Servicing rescan");
            if client.request_rescan(shared.as_ref()) == RescanOutcome::Stopped {
                break;
            }
        }
        debug!("Rescan worker stopped");
    }
}

impl ServiceThread for RescanWorker {
    fn start(&self) -> ServerResult<()> {
        let mut slot = self.handle.lock();
        if slot.is_some() {
            return Ok(());
        }
        let client = self.client.clone();
        let interval = self.interval;
        let shared = self.shared.clone();
        *slot = Some(spawn_named(THREAD_NAME, move || {
            Self::run(client, interval, shared)
        })?);
        Ok(())
    }

    fn request_stop(&self) {
        let mut state = self.shared.state.lock();
        state.stop = true;
        self.shared.cond.notify_all();
    }

    fn join(&self) {
        let handle = self.handle.lock().take();
        join_handle(THREAD_NAME, handle);
    }
}

impl RescanTrigger for RescanWorker {
    fn trigger_rescan(&self) {
        let mut state = self.shared.state.lock();
        state.manual = true;
        self.shared.cond.notify_all();
    }
}

impl Drop for RescanWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
