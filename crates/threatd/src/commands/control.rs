//! `threatd control`: commands for a running daemon.

use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use threatd_core::DetectorPaths;
use threatd_protocol::{ControlCode, ControlResponse};
use threatd_server::ControlClient;

use crate::cli::ControlAction;
use crate::error::{CliError, CliResult};

impl From<ControlAction> for ControlCode {
    fn from(action: ControlAction) -> Self {
        match action {
            ControlAction::Reload => Self::Reload,
            ControlAction::Shutdown => Self::Shutdown,
        }
    }
}

/// Sends `action` to the daemon behind `paths` and waits for its answer.
pub fn send(paths: &DetectorPaths, action: ControlAction, timeout: Duration) -> CliResult<()> {
    let socket = paths.control_socket();
    let request_id = Uuid::new_v4().to_string();
    debug!(socket = %socket.display(), request_id = %request_id, ?action, "Sending control request");

    let response = ControlClient::new(socket)
        .with_timeout(timeout)
        .send(request_id, action.into())?;
    match response {
        ControlResponse::Accepted => Ok(()),
        ControlResponse::Ignored { code } => Err(CliError::Ignored(code)),
    }
}
