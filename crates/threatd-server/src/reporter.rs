//! Threat reports.

use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, warn};

use threatd_protocol::{FrameWriter, ThreatReport};

use crate::error::ServerResult;

/// Receives every detection made by the scan engine.
pub trait ThreatReporter: Send + Sync {
    fn send_threat_report(&self, report: &ThreatReport);
}

/// Sends each report over a fresh connection to the report socket.
#[derive(Debug, Clone)]
pub struct SocketThreatReporter {
    socket_path: PathBuf,
    timeout: Duration,
}

impl SocketThreatReporter {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn send(&self, report: &ThreatReport) -> ServerResult<()> {
        let stream = UnixStream::connect(&self.socket_path)?;
        stream.set_write_timeout(Some(self.timeout))?;
        FrameWriter::new(&stream).write_message(report)?;
        Ok(())
    }
}

impl ThreatReporter for SocketThreatReporter {
    fn send_threat_report(&self, report: &ThreatReport) {
        match self.send(report) {
            Ok(()) => debug!(
                path = %report.path.display(),
                threat = %report.threat_name,
                "Sent threat report"
            ),
            Err(e) => warn!(
                path = %report.path.display(),
                socket = %self.socket_path.display(),
                error = %e,
                "Failed to send threat report"
            ),
        }
    }
}
