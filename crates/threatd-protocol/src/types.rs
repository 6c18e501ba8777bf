//! Message types for the daemon sockets.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::PROTOCOL_VERSION;

/// Envelope wrapping control messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Protocol version (always "1" for v1).
    pub protocol_version: String,
    /// Request ID for correlation.
    pub request_id: String,
    /// The actual payload.
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Creates a new envelope with the current protocol version.
    pub fn new(request_id: impl Into<String>, payload: T) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            request_id: request_id.into(),
            payload,
        }
    }

    /// Checks if this envelope uses a compatible protocol version.
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == PROTOCOL_VERSION
    }
}

// ---------------------------------------------------------------------------
// Process control
// ---------------------------------------------------------------------------

/// Commands understood by the control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlCode {
    /// Re-read engine settings and apply them.
    Reload,
    /// Shut down via the quick-restart path.
    Shutdown,
}

impl ControlCode {
    /// Wire value of the command.
    pub const fn code(self) -> u32 {
        match self {
            Self::Reload => 1,
            Self::Shutdown => 2,
        }
    }

    /// Maps a wire value to a known command.
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Reload),
            2 => Some(Self::Shutdown),
            _ => None,
        }
    }
}

/// A control request. The code is kept raw so unknown commands can be
/// logged rather than rejected by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub code: u32,
}

impl ControlRequest {
    pub fn new(command: ControlCode) -> Self {
        Self {
            code: command.code(),
        }
    }

    /// Returns the command, or `None` for codes this daemon does not know.
    pub fn command(&self) -> Option<ControlCode> {
        ControlCode::from_code(self.code)
    }
}

/// Reply to a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    /// The command was dispatched.
    Accepted,
    /// The code is unknown and was ignored.
    Ignored { code: u32 },
}

// ---------------------------------------------------------------------------
// Scanning
// ---------------------------------------------------------------------------

/// Request to scan one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub path: PathBuf,
}

impl ScanRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Outcome of a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Verdict {
    Clean,
    Threat { name: String, sha256: String },
    Error { message: String },
}

/// Reply to a [`ScanRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResponse {
    pub path: PathBuf,
    pub verdict: Verdict,
}

/// Request to re-evaluate a file from its cached metadata only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRescanRequest {
    pub path: PathBuf,
    pub sha256: String,
}

/// Reply to a [`MetadataRescanRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataRescanResponse {
    /// Metadata alone proves the file clean.
    Clean,
    /// The caller has to request a full scan.
    NeedsFullScan,
    /// The request could not be evaluated.
    Failed,
}

// ---------------------------------------------------------------------------
// Outbound notifications
// ---------------------------------------------------------------------------

/// Detection report sent to the reporting socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatReport {
    pub path: PathBuf,
    pub threat_name: String,
    pub sha256: String,
    pub detected_at: DateTime<Utc>,
}

/// Request asking the quarantine store to rescan its items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RescanRequest {
    pub requested_at: DateTime<Utc>,
}

impl RescanRequest {
    pub fn now() -> Self {
        Self {
            requested_at: Utc::now(),
        }
    }
}

/// Fan-out notice that engine settings or data changed and cached verdicts
/// must be discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateComplete {
    pub completed_at: DateTime<Utc>,
}

impl UpdateComplete {
    pub fn now() -> Self {
        Self {
            completed_at: Utc::now(),
        }
    }
}
