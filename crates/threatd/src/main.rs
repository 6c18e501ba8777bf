//! threatd entry point.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::Level;

use threatd::cli::{Cli, Command};
use threatd::commands;
use threatd::error::CliResult;
use threatd_core::{
    DetectorPaths, TracingConfig, TracingOutputFormat, default_install_root, init_tracing,
};

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli) {
        eprintln!("error: {e}");
        return ExitCode::from(commands::run::exit_status(commands::run::STARTUP_FAILED));
    }

    match cli.command {
        None => run_daemon(cli.install_root, false, commands::run::DEFAULT_FORCE_EXIT_SECS),
        Some(Command::Run {
            no_sandbox,
            force_exit_timeout,
        }) => run_daemon(cli.install_root, no_sandbox, force_exit_timeout),
        Some(Command::Control { action, timeout }) => {
            let paths = DetectorPaths::new(cli.install_root.unwrap_or_else(default_install_root));
            match commands::control::send(&paths, action, Duration::from_secs(timeout)) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("error: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn init_logging(cli: &Cli) -> CliResult<()> {
    let daemon = !matches!(cli.command, Some(Command::Control { .. }));
    let mut config = if cli.debug {
        TracingConfig::cli_debug()
    } else if daemon {
        TracingConfig::daemon()
    } else {
        TracingConfig::default().with_level(Level::WARN)
    };
    if let Some(format) = cli.log_format {
        config = config.with_format(TracingOutputFormat::from(format));
    }
    if let Some(path) = &cli.log_file {
        config = config.with_log_file(path);
    }
    init_tracing(config)?;
    Ok(())
}

fn run_daemon(
    install_root: Option<PathBuf>,
    no_sandbox: bool,
    force_exit_secs: u64,
) -> ExitCode {
    let config = commands::run::daemon_config(
        install_root,
        no_sandbox,
        Duration::from_secs(force_exit_secs),
    );
    let exit = commands::run::run(config);
    ExitCode::from(commands::run::exit_status(exit))
}
