//! Unix socket listener.
//!
//! Each listening socket runs an accept loop on its own thread and hands
//! every connection to a [`ConnectionHandler`] on a short-lived thread of its
//! own. The accept loop polls the listener together with a stop pipe, so a
//! stop request is observed without waiting for the next client.

use std::fs;
use std::io::ErrorKind;
use std::os::fd::AsFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, error, info, warn};

use threatd_protocol::{FrameReader, FrameWriter, ProtocolError};

use crate::config::SocketConfig;
use crate::error::{ServerError, ServerResult};
use crate::service::{ServiceThread, join_handle, spawn_named};
use crate::signals::NotifyPipe;

/// Serves one accepted connection.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(&self, stream: UnixStream);
}

/// A listening Unix socket served by a thread.
pub struct SocketServer {
    name: String,
    config: SocketConfig,
    listener: UnixListener,
    handler: Arc<dyn ConnectionHandler>,
    stop: Arc<NotifyPipe>,
    active: Arc<AtomicUsize>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SocketServer {
    /// Binds the socket described by `config`.
    ///
    /// A leftover socket file is removed when nothing answers on it; a live
    /// one means another instance is serving and binding fails.
    pub fn bind(
        name: impl Into<String>,
        config: SocketConfig,
        handler: Arc<dyn ConnectionHandler>,
    ) -> ServerResult<Self> {
        let socket_path = &config.socket_path;

        if let Some(parent) = socket_path.parent()
            && !parent.exists()
        {
            return Err(ServerError::socket_path_invalid(parent));
        }

        if config.cleanup_stale_socket && socket_path.exists() {
            match UnixStream::connect(socket_path) {
                Ok(_) => return Err(ServerError::socket_in_use(socket_path)),
                Err(_) => {
                    info!(path = %socket_path.display(), "Removing stale socket");
                    fs::remove_file(socket_path)?;
                }
            }
        } else if socket_path.exists() {
            return Err(ServerError::socket_in_use(socket_path));
        }

        let listener = UnixListener::bind(socket_path)?;
        listener.set_nonblocking(true)?;
        fs::set_permissions(socket_path, fs::Permissions::from_mode(config.mode))?;

        let name = name.into();
        info!(name = %name, path = %socket_path.display(), "Socket listening");

        Ok(Self {
            name,
            config,
            listener,
            handler,
            stop: Arc::new(NotifyPipe::new()?),
            active: Arc::new(AtomicUsize::new(0)),
            thread: Mutex::new(None),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl ServiceThread for SocketServer {
    fn start(&self) -> ServerResult<()> {
        let mut slot = self.thread.lock();
        if slot.is_some() {
            return Ok(());
        }
        let accept_loop = AcceptLoop {
            name: self.name.clone(),
            listener: self.listener.try_clone()?,
            config: self.config.clone(),
            handler: self.handler.clone(),
            stop: self.stop.clone(),
            active: self.active.clone(),
        };
        *slot = Some(spawn_named(&self.name, move || accept_loop.run())?);
        Ok(())
    }

    fn request_stop(&self) {
        self.stop.notify();
    }

    fn join(&self) {
        let handle = self.thread.lock().take();
        join_handle(&self.name, handle);
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        self.stop();
        if let Err(e) = fs::remove_file(&self.config.socket_path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(
                    path = %self.config.socket_path.display(),
                    error = %e,
                    "Failed to remove socket file"
                );
            }
        } else {
            debug!(path = %self.config.socket_path.display(), "Removed socket file");
        }
    }
}

struct AcceptLoop {
    name: String,
    listener: UnixListener,
    config: SocketConfig,
    handler: Arc<dyn ConnectionHandler>,
    stop: Arc<NotifyPipe>,
    active: Arc<AtomicUsize>,
}

/// Decrements the active connection count when a connection thread ends.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AcceptLoop {
    fn run(self) {
        debug!(name = %self.name, "Accept loop started");
        loop {
            let (listener_ready, stop_ready) = {
                let mut fds = [
                    PollFd::new(self.listener.as_fd(), PollFlags::POLLIN),
                    PollFd::new(self.stop.as_fd(), PollFlags::POLLIN),
                ];
                match poll(&mut fds, PollTimeout::NONE) {
                    Ok(_) => {}
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        error!(name = %self.name, error = %e, "Accept loop poll failed");
                        break;
                    }
                }
                let ready = |fd: &PollFd<'_>| fd.revents().is_some_and(|r| !r.is_empty());
                (ready(&fds[0]), ready(&fds[1]))
            };

            if stop_ready {
                break;
            }
            if listener_ready {
                self.accept_one();
            }
        }
        debug!(name = %self.name, "Accept loop stopped");
    }

    fn accept_one(&self) {
        let stream = match self.listener.accept() {
            Ok((stream, _addr)) => stream,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => return,
            Err(e) => {
                error!(name = %self.name, error = %e, "Failed to accept connection");
                return;
            }
        };

        if self.active.load(Ordering::SeqCst) >= self.config.max_connections {
            warn!(
                name = %self.name,
                max = self.config.max_connections,
                "Connection limit reached, dropping client"
            );
            return;
        }

        if let Err(e) = prepare_stream(&stream, &self.config) {
            warn!(name = %self.name, error = %e, "Failed to configure connection");
            return;
        }

        self.active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard(self.active.clone());
        let handler = self.handler.clone();
        let thread_name = format!("{}-conn", self.name);
        if let Err(e) = spawn_named(&thread_name, move || {
            let _guard = guard;
            handler.handle(stream);
        }) {
            error!(name = %self.name, error = %e, "Failed to spawn connection thread");
        }
    }
}

fn prepare_stream(stream: &UnixStream, config: &SocketConfig) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(config.connection_timeout))?;
    stream.set_write_timeout(Some(config.connection_timeout))?;
    Ok(())
}

/// Request/response loop shared by the framed sockets.
///
/// Reads requests until the peer closes the connection; every request gets
/// the reply `respond` produces.
pub(crate) fn serve_requests<Req, Resp, F>(name: &str, stream: &UnixStream, mut respond: F)
where
    Req: DeserializeOwned,
    Resp: Serialize,
    F: FnMut(Req) -> Resp,
{
    let mut reader = FrameReader::new(stream);
    let mut writer = FrameWriter::new(stream);
    loop {
        let request = match reader.read_message::<Req>() {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!(name, "Client disconnected");
                return;
            }
            Err(e) if e.is_timeout() => {
                debug!(name, "Connection timed out");
                return;
            }
            Err(e) => {
                warn!(name, error = %e, "Failed to read request");
                return;
            }
        };

        let response = respond(request);
        if let Err(e) = writer.write_message(&response) {
            log_write_error(name, &e);
            return;
        }
    }
}

fn log_write_error(name: &str, error: &ProtocolError) {
    if error.is_timeout() {
        debug!(name, "Timed out writing response");
    } else {
        warn!(name, error = %error, "Failed to write response");
    }
}
