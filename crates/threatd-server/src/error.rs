//! Server error types.

use std::io;
use std::path::Path;

use nix::errno::Errno;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur while bootstrapping or running the daemon.
///
/// Each variant belongs to exactly one exit-code category, see
/// [`DetectorExit::from_error`](crate::DetectorExit::from_error).
#[derive(Debug, Error)]
pub enum ServerError {
    /// IO error (socket, file, etc.).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error (framing, encoding, etc.).
    #[error("Protocol error: {0}")]
    Protocol(#[from] threatd_protocol::ProtocolError),

    /// Socket path already in use.
    #[error("Socket path already in use: {path}")]
    SocketInUse { path: String },

    /// Socket path parent directory does not exist.
    #[error("Socket path parent directory does not exist: {path}")]
    SocketPathInvalid { path: String },

    /// Another daemon instance holds the pid lock.
    #[error("Threat detector is already running (pid lock held: {path})")]
    AlreadyRunning { path: String },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// chroot(2) into the sandbox failed.
    #[error("Failed to enter sandbox at {path}: {source}")]
    EnterSandbox {
        path: String,
        #[source]
        source: Errno,
    },

    /// Dropping process capabilities failed.
    #[error("Failed to drop capabilities: {0}")]
    DropCapabilities(#[source] Errno),

    /// Setting no-new-privileges failed.
    #[error("Failed to lock capabilities: {0}")]
    LockCapabilities(#[source] Errno),

    /// chdir("/") inside the sandbox failed.
    #[error("Failed to change directory inside sandbox: {0}")]
    ChangeDirectory(#[source] Errno),

    /// The initial scan engine update was rejected.
    #[error("Initial scan engine update failed")]
    EngineUpdate,

    /// Internal consistency violation.
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// A system call failed.
    #[error("{context}: {source}")]
    System {
        context: String,
        #[source]
        source: Errno,
    },

    /// Installing a signal handler failed.
    #[error("Failed to install handler for signal {signal}: {source}")]
    Signal {
        signal: i32,
        #[source]
        source: io::Error,
    },

    /// A service thread could not be spawned.
    #[error("Failed to spawn thread {name}: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl ServerError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an internal consistency error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a system call error.
    pub fn system(context: impl Into<String>, source: Errno) -> Self {
        Self::System {
            context: context.into(),
            source,
        }
    }

    /// Creates a socket in use error.
    pub fn socket_in_use(path: &Path) -> Self {
        Self::SocketInUse {
            path: path.display().to_string(),
        }
    }

    /// Creates a socket path invalid error.
    pub fn socket_path_invalid(path: &Path) -> Self {
        Self::SocketPathInvalid {
            path: path.display().to_string(),
        }
    }

    /// Creates an already running error.
    pub fn already_running(path: &Path) -> Self {
        Self::AlreadyRunning {
            path: path.display().to_string(),
        }
    }

    /// Creates a thread spawn error.
    pub fn thread_spawn(name: impl Into<String>, source: io::Error) -> Self {
        Self::ThreadSpawn {
            name: name.into(),
            source,
        }
    }
}
