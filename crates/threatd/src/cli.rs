//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use threatd_core::TracingOutputFormat;

/// threatd - sandboxed threat detector daemon
#[derive(Debug, Parser)]
#[command(name = "threatd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Install root holding the plugin and its sandbox
    #[arg(long, env = "THREATD_INSTALL")]
    pub install_root: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v')]
    pub debug: bool,

    /// Log line format
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the daemon in the foreground (default)
    Run {
        /// Do not chroot or drop capabilities
        #[arg(long)]
        no_sandbox: bool,

        /// Seconds an orderly shutdown may take before the process is killed
        #[arg(long, default_value = "10")]
        force_exit_timeout: u64,
    },

    /// Send a command to a running daemon
    Control {
        #[command(subcommand)]
        action: ControlAction,

        /// Seconds to wait for the daemon to answer
        #[arg(long, default_value = "5")]
        timeout: u64,
    },
}

/// Process control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum ControlAction {
    /// Re-read engine settings
    Reload,

    /// Restart the daemon
    Shutdown,
}

/// Log line formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

impl From<LogFormat> for TracingOutputFormat {
    fn from(format: LogFormat) -> Self {
        match format {
            LogFormat::Pretty => Self::Pretty,
            LogFormat::Compact => Self::Compact,
            LogFormat::Json => Self::Json,
        }
    }
}
