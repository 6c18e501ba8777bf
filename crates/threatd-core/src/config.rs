//! Best-effort readers for the small configuration files the daemon consumes.
//!
//! None of these files are required. A missing file silently yields the
//! default, an unreadable or malformed one is logged and also yields the
//! default. The daemon never refuses to start because of them.

use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

/// Idle period after which the daemon restarts itself (1 hour).
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: i64 = 3600;

/// Period between quarantine rescans (4 hours).
pub const DEFAULT_RESCAN_INTERVAL_SECS: u64 = 14_400;

/// Errors raised while reading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value in {path}: {message}")]
    Invalid { path: String, message: String },
}

impl ConfigError {
    fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == ErrorKind::NotFound)
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn parse_json<T: for<'de> Deserialize<'de>>(path: &Path, text: &str) -> Result<T, ConfigError> {
    serde_json::from_str(text).map_err(|source| ConfigError::Json {
        path: path.display().to_string(),
        source,
    })
}

// ---------------------------------------------------------------------------
// Idle shutdown timeout
// ---------------------------------------------------------------------------

/// Contents of the idle shutdown configuration, `{"shutdownTimeout": <seconds>}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownTimeoutConfig {
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: i64,
}

fn default_shutdown_timeout() -> i64 {
    DEFAULT_SHUTDOWN_TIMEOUT_SECS
}

impl Default for ShutdownTimeoutConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
        }
    }
}

impl ShutdownTimeoutConfig {
    /// Parses the configuration file. Timeouts below one second are
    /// rejected: with nothing to wait for, the event loop would never block.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = read_file(path)?;
        let config: Self = parse_json(path, &text)?;
        if config.shutdown_timeout < 1 {
            return Err(ConfigError::Invalid {
                path: path.display().to_string(),
                message: format!(
                    "shutdownTimeout must be at least 1 second, got {}",
                    config.shutdown_timeout
                ),
            });
        }
        Ok(config)
    }

    /// Returns the configured timeout, falling back to the default.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => {
                info!(
                    path = %path.display(),
                    timeout_secs = config.shutdown_timeout,
                    "Loaded idle shutdown timeout"
                );
                config
            }
            Err(e) if e.is_not_found() => {
                debug!(path = %path.display(), "No idle shutdown config, using default");
                Self::default()
            }
            Err(e) => {
                warn!(error = %e, "Failed to load idle shutdown config, using default");
                Self::default()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Rescan interval
// ---------------------------------------------------------------------------

fn parse_rescan_interval(path: &Path, text: &str) -> Result<Duration, ConfigError> {
    let value: i64 = text.trim().parse().map_err(|_| ConfigError::Invalid {
        path: path.display().to_string(),
        message: format!("`{}` is not an integer", text.trim()),
    })?;
    if value < 1 {
        return Err(ConfigError::Invalid {
            path: path.display().to_string(),
            message: format!("interval must be at least 1 second, got {value}"),
        });
    }
    Ok(Duration::from_secs(value as u64))
}

/// Reads the rescan interval from a file holding a plain integer number of
/// seconds. Missing, unparsable and non-positive values yield the 4 hour
/// default.
pub fn read_rescan_interval(path: &Path) -> Duration {
    let default = Duration::from_secs(DEFAULT_RESCAN_INTERVAL_SECS);
    match read_file(path).and_then(|text| parse_rescan_interval(path, &text)) {
        Ok(interval) => {
            info!(interval_secs = interval.as_secs(), "Loaded rescan interval");
            interval
        }
        Err(e) if e.is_not_found() => default,
        Err(e) => {
            warn!(error = %e, default_secs = default.as_secs(), "Ignoring rescan interval");
            default
        }
    }
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawProxy {
    #[serde(default)]
    proxy: String,
    #[serde(default)]
    credentials: String,
}

/// Proxy used for cloud lookups.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub url: Url,
    pub credentials: Option<String>,
}

impl std::fmt::Debug for ProxySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySettings")
            .field("url", &self.url.as_str())
            .field("credentials", &self.credentials.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ProxySettings {
    /// Parses the proxy file. `Ok(None)` means the file names no proxy.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        let text = read_file(path)?;
        let raw: RawProxy = parse_json(path, &text)?;
        let address = raw.proxy.trim();
        if address.is_empty() {
            return Ok(None);
        }

        // bare host:port entries are plain HTTP proxies
        let url = if address.contains("://") {
            Url::parse(address)
        } else {
            Url::parse(&format!("http://{address}"))
        }
        .map_err(|e| ConfigError::Invalid {
                path: path.display().to_string(),
                message: format!("bad proxy address: {e}"),
            })?;

        let credentials = Some(raw.credentials).filter(|c| !c.is_empty());
        Ok(Some(Self { url, credentials }))
    }

    /// Loads the proxy, treating every failure as "no proxy".
    pub fn load_best_effort(path: &Path) -> Option<Self> {
        match Self::load(path) {
            Ok(Some(proxy)) => {
                info!(proxy = %proxy.url, "Using proxy");
                Some(proxy)
            }
            Ok(None) => {
                debug!("No proxy configured");
                None
            }
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                warn!(error = %e, "Failed to load proxy config, continuing without proxy");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    #[test]
    fn shutdown_timeout_missing_file_uses_default() {
        let dir = tempdir().unwrap();
        let config = ShutdownTimeoutConfig::load_or_default(&dir.path().join("absent"));
        assert_eq!(config.shutdown_timeout, 3600);
    }

    #[test]
    fn shutdown_timeout_parsed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("threat_detector_config");
        std::fs::write(&path, r#"{"shutdownTimeout": 60}"#).unwrap();
        assert_eq!(ShutdownTimeoutConfig::load_or_default(&path).shutdown_timeout, 60);
    }

    #[test]
    fn shutdown_timeout_malformed_uses_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("threat_detector_config");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            ShutdownTimeoutConfig::load(&path),
            Err(ConfigError::Json { .. })
        ));
        assert_eq!(ShutdownTimeoutConfig::load_or_default(&path).shutdown_timeout, 3600);
    }

    #[test]
    fn shutdown_timeout_below_one_second_uses_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("threat_detector_config");
        for value in [0, -1, -3600] {
            std::fs::write(&path, format!(r#"{{"shutdownTimeout": {value}}}"#)).unwrap();
            assert!(matches!(
                ShutdownTimeoutConfig::load(&path),
                Err(ConfigError::Invalid { .. })
            ));
            assert_eq!(ShutdownTimeoutConfig::load_or_default(&path).shutdown_timeout, 3600);
        }
    }

    #[test]
    fn rescan_interval_zero_falls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rescan_interval");
        std::fs::write(&path, "0").unwrap();
        assert_eq!(read_rescan_interval(&path), Duration::from_secs(14_400));
    }

    #[test]
    fn rescan_interval_parsed_with_whitespace() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rescan_interval");
        std::fs::write(&path, "120\n").unwrap();
        assert_eq!(read_rescan_interval(&path), Duration::from_secs(120));
    }

    #[test]
    fn rescan_interval_missing_file() {
        let dir = tempdir().unwrap();
        assert_eq!(
            read_rescan_interval(&dir.path().join("absent")),
            Duration::from_secs(14_400)
        );
    }

    #[test]
    fn proxy_bare_address() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("current_proxy");
        std::fs::write(&path, r#"{"proxy": "proxy.local:8080", "credentials": "c3VwZXI="}"#)
            .unwrap();
        let proxy = ProxySettings::load(&path).unwrap().unwrap();
        assert_eq!(proxy.url.as_str(), "http://proxy.local:8080/");
        assert_eq!(proxy.credentials.as_deref(), Some("c3VwZXI="));
        assert!(!format!("{proxy:?}").contains("c3VwZXI="));
    }

    #[test]
    fn proxy_with_scheme_is_kept() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("current_proxy");
        std::fs::write(&path, r#"{"proxy": "https://proxy.local:3128"}"#).unwrap();
        let proxy = ProxySettings::load(&path).unwrap().unwrap();
        assert_eq!(proxy.url.scheme(), "https");
        assert_eq!(proxy.url.host_str(), Some("proxy.local"));
        assert_eq!(proxy.url.port(), Some(3128));
        assert!(proxy.credentials.is_none());
    }

    #[test]
    fn proxy_empty_means_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("current_proxy");
        std::fs::write(&path, r#"{"proxy": ""}"#).unwrap();
        assert!(ProxySettings::load(&path).unwrap().is_none());
    }

    #[test]
    fn proxy_malformed_is_not_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("current_proxy");
        std::fs::write(&path, "[1, 2").unwrap();
        assert!(ProxySettings::load_best_effort(&path).is_none());
        assert!(ProxySettings::load_best_effort(&dir.path().join("absent")).is_none());
    }

    proptest! {
        #[test]
        fn rescan_interval_is_always_positive(text in ".*") {
            let dir = tempdir().unwrap();
            let path = dir.path().join("rescan_interval");
            std::fs::write(&path, &text).unwrap();
            let interval = read_rescan_interval(&path);
            prop_assert!(interval >= Duration::from_secs(1));
            match text.trim().parse::<i64>() {
                Ok(n) if n >= 1 => prop_assert_eq!(interval, Duration::from_secs(n as u64)),
                _ => prop_assert_eq!(interval, Duration::from_secs(DEFAULT_RESCAN_INTERVAL_SECS)),
            }
        }
    }
}
