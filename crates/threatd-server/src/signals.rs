//! Pollable lifecycle inputs.
//!
//! Every input of the event loop is a file descriptor: signals are forwarded
//! into a self-pipe by `signal-hook`, the internal restart trigger is a plain
//! [`NotifyPipe`]. The loop polls the read ends and asks the monitor whether
//! its input fired.

use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use signal_hook::SigId;
use signal_hook::consts::{SIGTERM, SIGUSR1};
use tracing::{debug, info, warn};

use crate::error::{ServerError, ServerResult};

/// A non-blocking notification channel with a pollable read end.
///
/// Any number of [`notify`](Self::notify) calls before a
/// [`drain`](Self::drain) collapse into one pending notification.
#[derive(Debug)]
pub struct NotifyPipe {
    reader: UnixStream,
    writer: UnixStream,
}

impl NotifyPipe {
    pub fn new() -> ServerResult<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Self { reader, writer })
    }

    /// Marks the channel readable. Safe to call from any thread.
    pub fn notify(&self) {
        match (&self.writer).write(&[1]) {
            Ok(_) => {}
            // buffer full, a notification is pending anyway
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => warn!(error = %e, "Failed to write notification"),
        }
    }

    /// Consumes every pending notification. Returns true if there was any.
    pub fn drain(&self) -> bool {
        let mut buf = [0u8; 64];
        let mut pending = false;
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => pending = true,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "Failed to drain notification pipe");
                    break;
                }
            }
        }
        pending
    }

    fn writer_handle(&self) -> ServerResult<UnixStream> {
        Ok(self.writer.try_clone()?)
    }
}

impl AsFd for NotifyPipe {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }
}

/// An event loop input.
pub trait SignalMonitor: AsFd + Send + Sync {
    /// Consumes the pending input and handles it. Returns true if the input
    /// had fired since the previous call.
    fn triggered(&self) -> bool;
}

impl SignalMonitor for NotifyPipe {
    fn triggered(&self) -> bool {
        self.drain()
    }
}

impl<T: SignalMonitor + ?Sized> SignalMonitor for Arc<T> {
    fn triggered(&self) -> bool {
        (**self).triggered()
    }
}

/// Something that can be told to reload its configuration.
pub trait Reloadable: Send + Sync {
    fn reload(&self);
}

/// Forwards one Unix signal into a [`NotifyPipe`].
///
/// The handler is installed with `SA_RESTART`, so system calls interrupted
/// by the signal are restarted instead of failing with `EINTR`. Dropping the
/// monitor unregisters the handler.
pub struct SignalPipeMonitor {
    signal: i32,
    pipe: NotifyPipe,
    id: SigId,
}

impl SignalPipeMonitor {
    pub fn register(signal: i32) -> ServerResult<Self> {
        let pipe = NotifyPipe::new()?;
        let id = signal_hook::low_level::pipe::register(signal, pipe.writer_handle()?)
            .map_err(|source| ServerError::Signal { signal, source })?;
        debug!(signal, "Registered signal monitor");
        Ok(Self { signal, pipe, id })
    }

    /// Monitor for SIGTERM.
    pub fn terminate() -> ServerResult<Self> {
        Self::register(SIGTERM)
    }

    pub fn signal(&self) -> i32 {
        self.signal
    }
}

impl AsFd for SignalPipeMonitor {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.pipe.as_fd()
    }
}

impl SignalMonitor for SignalPipeMonitor {
    fn triggered(&self) -> bool {
        self.pipe.drain()
    }
}

impl Drop for SignalPipeMonitor {
    fn drop(&mut self) {
        signal_hook::low_level::unregister(self.id);
    }
}

/// Runs a reload whenever its source input fires.
pub struct ReloadMonitor {
    source: Box<dyn SignalMonitor>,
    target: Arc<dyn Reloadable>,
}

impl ReloadMonitor {
    pub fn new(source: Box<dyn SignalMonitor>, target: Arc<dyn Reloadable>) -> Self {
        Self { source, target }
    }

    /// Reloads on SIGUSR1.
    pub fn usr1(target: Arc<dyn Reloadable>) -> ServerResult<Self> {
        let source = SignalPipeMonitor::register(SIGUSR1)?;
        Ok(Self::new(Box::new(source), target))
    }
}

impl AsFd for ReloadMonitor {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.source.as_fd()
    }
}

impl SignalMonitor for ReloadMonitor {
    fn triggered(&self) -> bool {
        if !self.source.triggered() {
            return false;
        }
        info!("Reload requested");
        self.target.reload();
        true
    }
}
