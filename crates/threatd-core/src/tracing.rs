//! Logging for the daemon and the `threatd control` client.
//!
//! The daemon logs JSON lines, one service thread per line prefix, and is
//! usually pointed at a log file. That file must be opened before the
//! process chroots into its sandbox: the subscriber keeps the open handle, so
//! the path does not have to exist inside the sandbox.
//!
//! ```ignore
//! use threatd_core::tracing::{init_tracing, TracingConfig};
//!
//! init_tracing(TracingConfig::daemon().with_log_file("/opt/threatd/log/threat_detector.log"))?;
//! ```

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::fmt::{self, format::FmtSpan, writer::BoxMakeWriter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Crate prefix every threatd target starts with.
const TARGET_PREFIX: &str = "threatd";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Errors raised while installing the global subscriber.
#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to set global tracing subscriber: {0}")]
    SetGlobalSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Log line layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TracingOutputFormat {
    /// Multi-line, for reading in a terminal
    Pretty,
    #[default]
    Compact,
    /// One JSON object per line
    Json,
}

/// How and where log lines are written.
///
/// `RUST_LOG` takes precedence over `level` unless an explicit `filter` is
/// set.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub level: Level,
    pub format: TracingOutputFormat,
    /// File and line of the log call
    pub source_location: bool,
    pub target: bool,
    /// Name of the emitting thread (`control`, `rescan-worker`, ...)
    pub thread_names: bool,
    pub span_events: bool,
    pub filter: Option<String>,
    /// Append here instead of writing to stderr
    pub log_file: Option<PathBuf>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: TracingOutputFormat::Compact,
            source_location: false,
            target: true,
            thread_names: false,
            span_events: false,
            filter: None,
            log_file: None,
        }
    }
}

impl TracingConfig {
    /// Verbose terminal output for `--debug`.
    #[must_use]
    pub fn cli_debug() -> Self {
        Self {
            level: Level::DEBUG,
            source_location: true,
            ..Self::default()
        }
    }

    /// JSON lines tagged with the emitting service thread.
    #[must_use]
    pub fn daemon() -> Self {
        Self {
            format: TracingOutputFormat::Json,
            source_location: true,
            thread_names: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: TracingOutputFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    #[must_use]
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    fn env_filter(&self) -> Result<EnvFilter, TracingError> {
        match &self.filter {
            Some(directive) => Ok(EnvFilter::try_new(directive)?),
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("{TARGET_PREFIX}={}", self.level)))),
        }
    }

    fn make_writer(&self) -> Result<BoxMakeWriter, TracingError> {
        let Some(path) = &self.log_file else {
            return Ok(BoxMakeWriter::new(std::io::stderr));
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| TracingError::LogFile {
                path: path.clone(),
                source,
            })?;
        Ok(BoxMakeWriter::new(Arc::new(file)))
    }

    fn fmt_layer(&self, writer: BoxMakeWriter) -> BoxedLayer {
        let span_events = if self.span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(self.log_file.is_none())
            .with_file(self.source_location)
            .with_line_number(self.source_location)
            .with_target(self.target)
            .with_thread_names(self.thread_names)
            .with_span_events(span_events);
        match self.format {
            TracingOutputFormat::Pretty => layer.pretty().boxed(),
            TracingOutputFormat::Compact => layer.compact().boxed(),
            TracingOutputFormat::Json => layer.json().boxed(),
        }
    }
}

/// Installs the global subscriber described by `config`.
///
/// # Errors
///
/// Fails if a subscriber is already installed, if the filter directive does
/// not parse, or if the log file cannot be opened.
pub fn init_tracing(config: TracingConfig) -> Result<(), TracingError> {
    let filter = config.env_filter()?;
    let layer = config.fmt_layer(config.make_writer()?);
    tracing::subscriber::set_global_default(tracing_subscriber::registry().with(layer).with(filter))?;
    Ok(())
}
