//! Threat detector daemon and its control CLI.
//!
//! This crate provides the `threatd` binary: `threatd run` starts the daemon
//! in the foreground, `threatd control` talks to a running one.

pub mod cli;
pub mod commands;
pub mod error;

pub use cli::Cli;
pub use error::{CliError, CliResult};
