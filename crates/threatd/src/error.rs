//! CLI error types.

use thiserror::Error;

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;

/// Errors reported by the CLI before or after talking to the daemon.
#[derive(Debug, Error)]
pub enum CliError {
    /// Logging could not be set up.
    #[error("failed to initialise logging: {0}")]
    Tracing(#[from] threatd_core::TracingError),

    /// The daemon could not be reached or answered badly.
    #[error("control request failed: {0}")]
    Control(#[from] threatd_server::ServerError),

    /// The daemon did not recognise the command.
    #[error("daemon ignored control code {0}")]
    Ignored(u32),
}
