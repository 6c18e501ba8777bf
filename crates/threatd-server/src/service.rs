//! Long-lived service threads.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::error::{ServerError, ServerResult};

/// A service that runs on its own OS thread.
///
/// Stopping is always two-phase: [`request_stop`](Self::request_stop) only
/// signals the thread and must not block, [`join`](Self::join) waits for it.
/// Callers stopping several services request all stops first and then join,
/// so the threads wind down in parallel.
pub trait ServiceThread: Send + Sync {
    /// Spawns the service thread.
    fn start(&self) -> ServerResult<()>;

    /// Asks the thread to finish. Never blocks.
    fn request_stop(&self);

    /// Waits for the thread to finish. A no-op if it was never started.
    fn join(&self);

    /// Requests a stop and waits for it.
    fn stop(&self) {
        self.request_stop();
        self.join();
    }
}

impl<T: ServiceThread + ?Sized> ServiceThread for Arc<T> {
    fn start(&self) -> ServerResult<()> {
        (**self).start()
    }

    fn request_stop(&self) {
        (**self).request_stop();
    }

    fn join(&self) {
        (**self).join();
    }
}

/// Spawns a named thread, mapping spawn failures to [`ServerError::ThreadSpawn`].
pub(crate) fn spawn_named<F>(name: &str, body: F) -> ServerResult<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|e| ServerError::thread_spawn(name, e))
}

/// Joins a handle taken out of its slot, logging a panicked thread.
pub(crate) fn join_handle(name: &str, handle: Option<JoinHandle<()>>) {
    let Some(handle) = handle else {
        return;
    };
    if handle.join().is_err() {
        warn!(thread = name, "Service thread panicked");
    } else {
        debug!(thread = name, "Service thread joined");
    }
}

/// Services started during bootstrap, stopped together in reverse order.
///
/// Dropping the set stops whatever is still running, which covers the
/// bootstrap error paths.
#[derive(Default)]
pub struct RunningServices {
    services: Vec<Arc<dyn ServiceThread>>,
}

impl RunningServices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a service and takes responsibility for stopping it.
    pub fn start(&mut self, service: Arc<dyn ServiceThread>) -> ServerResult<()> {
        service.start()?;
        self.services.push(service);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Requests every stop, then joins in reverse start order.
    pub fn stop_all(&mut self) {
        for service in &self.services {
            service.request_stop();
        }
        while let Some(service) = self.services.pop() {
            service.join();
        }
    }
}

impl Drop for RunningServices {
    fn drop(&mut self) {
        self.stop_all();
    }
}
