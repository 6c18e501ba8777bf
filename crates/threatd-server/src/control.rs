//! Process control socket.
//!
//! Other components of the product ask the daemon to reload its settings or
//! to shut down through this socket. Unknown command codes are logged and
//! answered with [`ControlResponse::Ignored`]; they never fail the connection.

use std::io::ErrorKind;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use threatd_protocol::{
    ControlCode, ControlRequest, ControlResponse, Envelope, FrameReader, FrameWriter,
    PROTOCOL_VERSION,
};

use crate::error::{ServerError, ServerResult};
use crate::socket::{ConnectionHandler, serve_requests};

/// Lifecycle operations reachable from the control socket.
pub trait ControlCallback: Send + Sync {
    fn reload(&self);
    fn shutdown(&self);
}

/// Dispatches control requests to a [`ControlCallback`].
pub struct ControlHandler {
    callback: Arc<dyn ControlCallback>,
}

impl ControlHandler {
    pub fn new(callback: Arc<dyn ControlCallback>) -> Self {
        Self { callback }
    }

    fn dispatch(&self, request: ControlRequest) -> ControlResponse {
        match request.command() {
            Some(ControlCode::Reload) => {
                info!("Reload requested over control socket");
                self.callback.reload();
                ControlResponse::Accepted
            }
            Some(ControlCode::Shutdown) => {
                info!("Shutdown requested over control socket");
                self.callback.shutdown();
                ControlResponse::Accepted
            }
            None => {
                warn!(code = request.code, "Ignoring unknown process control code");
                ControlResponse::Ignored { code: request.code }
            }
        }
    }
}

impl ConnectionHandler for ControlHandler {
    fn handle(&self, stream: UnixStream) {
        serve_requests(
            "control",
            &stream,
            |envelope: Envelope<ControlRequest>| {
                if !envelope.is_compatible() {
                    warn!(
                        version = %envelope.protocol_version,
                        expected = PROTOCOL_VERSION,
                        "Incompatible protocol version"
                    );
                }
                Envelope::new(envelope.request_id, self.dispatch(envelope.payload))
            },
        );
    }
}

/// Client side of the control socket.
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl ControlClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: Duration::from_secs(5),
        }
    }

    /// Builder: set the connect/read/write timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends one command and waits for the daemon's answer.
    pub fn send(
        &self,
        request_id: impl Into<String>,
        command: ControlCode,
    ) -> ServerResult<ControlResponse> {
        let stream = UnixStream::connect(&self.socket_path)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        let request = Envelope::new(request_id, ControlRequest::new(command));
        FrameWriter::new(&stream).write_message(&request)?;

        let reply: Option<Envelope<ControlResponse>> = FrameReader::new(&stream).read_message()?;
        match reply {
            Some(envelope) if envelope.request_id == request.request_id => Ok(envelope.payload),
            Some(envelope) => Err(ServerError::internal(format!(
                "reply for request {} does not match request {}",
                envelope.request_id, request.request_id
            ))),
            None => Err(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "control socket closed without a reply",
            )
            .into()),
        }
    }
}
