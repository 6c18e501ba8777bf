//! Process exit codes.
//!
//! The supervisor decides whether to relaunch the daemon, and how quickly,
//! from these values. They are part of the daemon's external interface and
//! must never be renumbered.

use std::any::Any;
use std::io::ErrorKind;
use std::panic::{AssertUnwindSafe, catch_unwind};

use nix::errno::Errno;
use tracing::error;

use crate::error::{ServerError, ServerResult};

/// Every exit status the daemon can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectorExit {
    /// Terminated on request.
    CleanSuccess,
    /// Event loop hit an unrecoverable wait error.
    GenericFailure,
    /// chroot into the sandbox failed.
    SandboxEntryFailed,
    /// Dropping capabilities failed.
    CapabilityDropFailed,
    /// Setting no-new-privileges failed.
    CapabilityLockFailed,
    /// chdir inside the sandbox failed.
    ChangeDirectoryFailed,
    /// The forced initial engine update failed.
    EngineUpdateFailed,
    /// Internal consistency error.
    InternalError,
    /// Socket layer error.
    SocketError,
    /// Underlying system call or library error.
    SystemError,
    /// Any other runtime error.
    RuntimeError,
    /// Allocation failure.
    OutOfMemory,
    /// Panic or anything else nobody anticipated.
    Unexpected,
    /// Deliberate restart: idle timeout, changed system files, control shutdown.
    QuickRestart,
}

impl DetectorExit {
    /// Numeric process exit status.
    pub const fn code(self) -> i32 {
        match self {
            Self::CleanSuccess => 0,
            Self::GenericFailure => 1,
            Self::SandboxEntryFailed => 30,
            Self::CapabilityDropFailed => 31,
            Self::CapabilityLockFailed => 32,
            Self::ChangeDirectoryFailed => 33,
            Self::EngineUpdateFailed => 34,
            Self::InternalError => 35,
            Self::SocketError => 36,
            Self::SystemError => 37,
            Self::RuntimeError => 38,
            Self::OutOfMemory => 39,
            Self::Unexpected => 40,
            Self::QuickRestart => 77,
        }
    }

    /// Returns true for the two outcomes the supervisor treats as success.
    pub const fn is_success(self) -> bool {
        matches!(self, Self::CleanSuccess | Self::QuickRestart)
    }

    /// Maps a fatal error to its exit category.
    pub fn from_error(err: &ServerError) -> Self {
        match err {
            ServerError::EnterSandbox { .. } => Self::SandboxEntryFailed,
            ServerError::DropCapabilities(_) => Self::CapabilityDropFailed,
            ServerError::LockCapabilities(_) => Self::CapabilityLockFailed,
            ServerError::ChangeDirectory(_) => Self::ChangeDirectoryFailed,
            ServerError::EngineUpdate => Self::EngineUpdateFailed,
            ServerError::Internal { .. } => Self::InternalError,
            ServerError::SocketInUse { .. }
            | ServerError::SocketPathInvalid { .. }
            | ServerError::Protocol(_) => Self::SocketError,
            ServerError::Io(e) if e.kind() == ErrorKind::OutOfMemory => Self::OutOfMemory,
            ServerError::System {
                source: Errno::ENOMEM,
                ..
            } => Self::OutOfMemory,
            ServerError::Io(_) | ServerError::System { .. } | ServerError::Signal { .. } => {
                Self::SystemError
            }
            ServerError::AlreadyRunning { .. }
            | ServerError::Config { .. }
            | ServerError::ThreadSpawn { .. } => Self::RuntimeError,
        }
    }

    fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("");
        error!(panic = message, "Threat detector panicked");
        if message.contains("capacity overflow") {
            Self::OutOfMemory
        } else {
            Self::Unexpected
        }
    }
}

/// Runs the daemon body and reduces every way it can end to an exit code.
///
/// This is the outermost dispatch: errors are logged and categorised, panics
/// are caught so the process always exits with a defined status.
pub fn run_guarded<F>(body: F) -> DetectorExit
where
    F: FnOnce() -> ServerResult<DetectorExit>,
{
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(exit)) => exit,
        Ok(Err(err)) => {
            let exit = DetectorExit::from_error(&err);
            error!(error = %err, code = exit.code(), "Threat detector failed");
            exit
        }
        Err(payload) => DetectorExit::from_panic(payload.as_ref()),
    }
}
