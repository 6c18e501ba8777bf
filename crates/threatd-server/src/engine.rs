//! Scan engine host.
//!
//! The lifecycle only talks to the engine through [`ScanEngineFactory`].
//! [`DigestEngineFactory`] is the engine shipped with the daemon: it matches
//! file digests against a SHA-256 blocklist from the engine data directory
//! and honours the allow-lists of the engine settings.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use threatd_core::ProxySettings;
use threatd_protocol::{
    MetadataRescanRequest, MetadataRescanResponse, ScanRequest, ScanResponse, ThreatReport,
    Verdict,
};

use crate::notify::UpdateCompleteNotifier;
use crate::reporter::ThreatReporter;
use crate::shutdown_timer::ShutdownTimer;

/// Blocklist file inside the engine data directory.
pub const BLOCKLIST_FILE: &str = "blocklist";

/// Errors raised while reading engine settings.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse engine settings {path}: {source}")]
    Settings {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// The scan engine as seen by the lifecycle.
pub trait ScanEngineFactory: Send + Sync {
    /// Loads new engine data. Returns false if the data could not be loaded.
    fn update(&self) -> bool;

    /// Pushes the current settings into the live engine. Returns false if
    /// there is no live engine or it rejected them.
    fn reload(&self) -> bool;

    /// Re-reads the settings file. Returns whether any setting that affects
    /// verdicts changed.
    fn update_settings(&self) -> Result<bool, EngineError>;

    /// Whether the engine has been initialised by a scan.
    fn is_initialized(&self) -> bool;

    /// Loads the settings unless that already happened.
    fn load_settings_if_required(&self);

    /// Releases the live engine.
    fn shutdown(&self);

    fn scan(&self, request: &ScanRequest) -> ScanResponse;

    fn rescan_metadata(&self, request: &MetadataRescanRequest) -> MetadataRescanResponse;
}

/// Engine settings file, `engine_settings.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSettings {
    #[serde(default = "enabled")]
    pub enable_sxl_lookup: bool,
    #[serde(default)]
    pub sha_allow_list: Vec<String>,
    #[serde(default)]
    pub path_allow_list: Vec<String>,
    #[serde(default = "enabled")]
    pub machine_learning: bool,
}

fn enabled() -> bool {
    true
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            enable_sxl_lookup: true,
            sha_allow_list: Vec::new(),
            path_allow_list: Vec::new(),
            machine_learning: true,
        }
    }
}

impl EngineSettings {
    /// Reads the settings file. `Ok(None)` if it does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>, EngineError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(EngineError::Io {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| EngineError::Settings {
                path: path.display().to_string(),
                source,
            })
    }

    /// Digest over the settings that influence verdicts. Ordering,
    /// duplicates, letter case of digests and surrounding whitespace in the
    /// allow-lists do not count as changes.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update([
            u8::from(self.enable_sxl_lookup),
            u8::from(self.machine_learning),
        ]);

        let shas = normalized(self.sha_allow_list.iter().map(|s| s.trim().to_ascii_lowercase()));
        let paths = normalized(self.path_allow_list.iter().map(|s| s.trim().to_string()));
        for list in [shas, paths] {
            hasher.update((list.len() as u64).to_le_bytes());
            for entry in list {
                hasher.update(entry.as_bytes());
                hasher.update([0u8]);
            }
        }
        format!("{:x}", hasher.finalize())
    }

    fn allows_sha(&self, sha256: &str) -> bool {
        self.sha_allow_list
            .iter()
            .any(|allowed| allowed.trim().eq_ignore_ascii_case(sha256))
    }

    fn allows_path(&self, path: &Path) -> bool {
        self.path_allow_list
            .iter()
            .any(|prefix| !prefix.trim().is_empty() && path.starts_with(prefix.trim()))
    }
}

fn normalized(entries: impl Iterator<Item = String>) -> Vec<String> {
    let mut entries: Vec<String> = entries.filter(|e| !e.is_empty()).collect();
    entries.sort();
    entries.dedup();
    entries
}

fn is_sha256(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Parses `<sha256> <threat name>` lines. Blank lines and `#` comments are
/// skipped, malformed lines are logged and skipped.
pub fn parse_blocklist(text: &str) -> HashMap<String, String> {
    let mut entries = HashMap::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (sha, name) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let name = name.trim();
        if !is_sha256(sha) || name.is_empty() {
            warn!(line = index + 1, "Skipping malformed blocklist entry");
            continue;
        }
        entries.insert(sha.to_ascii_lowercase(), name.to_string());
    }
    entries
}

/// SHA-256 of a file's contents, lower-case hex.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// What the engine needs from the rest of the daemon.
pub struct EngineDependencies {
    pub reporter: Arc<dyn ThreatReporter>,
    pub shutdown_timer: Arc<ShutdownTimer>,
    pub notifier: Arc<dyn UpdateCompleteNotifier>,
    pub proxy: Option<ProxySettings>,
}

/// Digest-matching engine.
///
/// The engine initialises lazily on the first scan request, which also
/// starts the idle timer in earnest: a daemon that never scanned has
/// nothing to give back by restarting.
pub struct DigestEngineFactory {
    settings_path: PathBuf,
    data_dir: PathBuf,
    deps: EngineDependencies,
    /// Latest settings read from disk.
    settings: RwLock<EngineSettings>,
    settings_digest: Mutex<Option<String>>,
    blocklist: RwLock<Arc<HashMap<String, String>>>,
    /// Settings the live engine runs with; `None` until initialised.
    live: RwLock<Option<EngineSettings>>,
    initialized: AtomicBool,
}

impl DigestEngineFactory {
    pub fn new(
        settings_path: impl Into<PathBuf>,
        data_dir: impl Into<PathBuf>,
        deps: EngineDependencies,
    ) -> Self {
        Self {
            settings_path: settings_path.into(),
            data_dir: data_dir.into(),
            deps,
            settings: RwLock::new(EngineSettings::default()),
            settings_digest: Mutex::new(None),
            blocklist: RwLock::new(Arc::new(HashMap::new())),
            live: RwLock::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn proxy(&self) -> Option<&ProxySettings> {
        self.deps.proxy.as_ref()
    }

    /// Returns the live settings, initialising the engine on first use.
    fn live_settings(&self) -> EngineSettings {
        if let Some(settings) = self.live.read().as_ref() {
            return settings.clone();
        }
        let mut live = self.live.write();
        live.get_or_insert_with(|| {
            let settings = self.settings.read().clone();
            info!(
                sxl_lookup = settings.enable_sxl_lookup,
                machine_learning = settings.machine_learning,
                proxy = self.deps.proxy.as_ref().map(|p| p.url.as_str()),
                "Scan engine initialised"
            );
            self.initialized.store(true, Ordering::SeqCst);
            settings
        })
        .clone()
    }

    fn verdict_for(&self, path: &Path, settings: &EngineSettings) -> Verdict {
        if settings.allows_path(path) {
            debug!(path = %path.display(), "Path is allow-listed");
            return Verdict::Clean;
        }

        let sha256 = match sha256_file(path) {
            Ok(sha256) => sha256,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Failed to read file for scan");
                return Verdict::Error {
                    message: e.to_string(),
                };
            }
        };

        if settings.allows_sha(&sha256) {
            debug!(path = %path.display(), "Digest is allow-listed");
            return Verdict::Clean;
        }

        let blocklist = self.blocklist.read().clone();
        match blocklist.get(&sha256) {
            Some(name) => {
                info!(path = %path.display(), threat = %name, "Threat detected");
                self.deps.reporter.send_threat_report(&ThreatReport {
                    path: path.to_path_buf(),
                    threat_name: name.clone(),
                    sha256: sha256.clone(),
                    detected_at: Utc::now(),
                });
                Verdict::Threat {
                    name: name.clone(),
                    sha256,
                }
            }
            None => Verdict::Clean,
        }
    }
}

impl ScanEngineFactory for DigestEngineFactory {
    fn update(&self) -> bool {
        let path = self.data_dir.join(BLOCKLIST_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %path.display(), "No blocklist, engine data is empty");
                String::new()
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to load engine data");
                return false;
            }
        };

        let blocklist = parse_blocklist(&text);
        let entries = blocklist.len();
        let changed = {
            let mut current = self.blocklist.write();
            let changed = **current != blocklist;
            *current = Arc::new(blocklist);
            changed
        };
        info!(entries, changed, "Scan engine data updated");

        if changed && self.is_initialized() {
            self.deps.notifier.update_complete();
        }
        true
    }

    fn reload(&self) -> bool {
        let mut live = self.live.write();
        match live.as_mut() {
            Some(settings) => {
                *settings = self.settings.read().clone();
                info!("Live scan engine reloaded");
                true
            }
            None => {
                debug!("No live scan engine to reload");
                false
            }
        }
    }

    fn update_settings(&self) -> Result<bool, EngineError> {
        let settings = match EngineSettings::load(&self.settings_path)? {
            Some(settings) => settings,
            None => {
                debug!(path = %self.settings_path.display(), "No engine settings, using defaults");
                EngineSettings::default()
            }
        };
        let digest = settings.digest();

        let changed = {
            let mut current = self.settings_digest.lock();
            let changed = current.as_deref() != Some(digest.as_str());
            *current = Some(digest);
            changed
        };
        *self.settings.write() = settings;

        debug!(changed, "Engine settings read");
        Ok(changed)
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn load_settings_if_required(&self) {
        let loaded = self.settings_digest.lock().is_some();
        if loaded {
            return;
        }
        if let Err(e) = self.update_settings() {
            warn!(error = %e, "Failed to load engine settings, using defaults");
        }
    }

    fn shutdown(&self) {
        if self.live.write().take().is_some() {
            info!("Scan engine shut down");
        }
        self.initialized.store(false, Ordering::SeqCst);
    }

    fn scan(&self, request: &ScanRequest) -> ScanResponse {
        let settings = self.live_settings();
        let verdict = self.verdict_for(&request.path, &settings);
        self.deps.shutdown_timer.reset();
        ScanResponse {
            path: request.path.clone(),
            verdict,
        }
    }

    fn rescan_metadata(&self, request: &MetadataRescanRequest) -> MetadataRescanResponse {
        let settings = self.live_settings();
        self.deps.shutdown_timer.reset();

        if !is_sha256(&request.sha256) {
            debug!(path = %request.path.display(), "Metadata rescan without a valid digest");
            return MetadataRescanResponse::Failed;
        }
        if settings.allows_path(&request.path) || settings.allows_sha(&request.sha256) {
            MetadataRescanResponse::Clean
        } else {
            MetadataRescanResponse::NeedsFullScan
        }
    }
}
