//! Engine configuration.
//!
//! Loaded from `pomoflow.json` in the data directory when present, then
//! overridden by `POMOFLOW_*` environment variables.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PomoflowError, Result};

/// File name of the configuration inside the data directory.
pub const CONFIG_FILE: &str = "pomoflow.json";

pub const DEFAULT_DEBOUNCE_MS: u64 = 500;
pub const DEFAULT_SYNC_INTERVAL_MS: u64 = 300_000;
pub const DEFAULT_HISTORY_CAPACITY: usize = 50;
pub const DEFAULT_HISTORY_JOURNAL_WINDOW: usize = 20;
pub const DEFAULT_TRANSACTION_HISTORY: usize = 50;
pub const DEFAULT_QUOTA_THRESHOLD_PERCENT: f64 = 95.0;
/// 50 MiB, roughly what a browser grants an origin before prompting.
pub const DEFAULT_STORAGE_BUDGET_BYTES: u64 = 50 * 1024 * 1024;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;

/// Which remote blob store sync talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// GitHub Gist.
    Gist,
    /// JSONBin.io.
    JsonBin,
    /// In-process store, for local testing.
    Memory,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Gist => "gist",
            ProviderKind::JsonBin => "jsonbin",
            ProviderKind::Memory => "memory",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "gist" | "github" => Some(ProviderKind::Gist),
            "jsonbin" => Some(ProviderKind::JsonBin),
            "memory" => Some(ProviderKind::Memory),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings for one remote provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub enabled: bool,

    /// API root, overridable for self-hosted mirrors and tests.
    pub base_url: String,
}

/// Remote sync settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Provider used when more than one is enabled.
    #[serde(default = "default_provider")]
    pub active_provider: ProviderKind,

    #[serde(default = "default_sync_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_gist")]
    pub gist: ProviderConfig,

    #[serde(default = "default_jsonbin")]
    pub jsonbin: ProviderConfig,
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding stores, journal, sync state and local settings.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    #[serde(default = "default_history_journal_window")]
    pub history_journal_window: usize,

    #[serde(default = "default_transaction_history")]
    pub transaction_history: usize,

    #[serde(default = "default_quota_threshold")]
    pub quota_threshold_percent: f64,

    #[serde(default = "default_storage_budget")]
    pub storage_budget_bytes: u64,

    #[serde(default = "default_sync_config")]
    pub sync: SyncConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".pomoflow")
}
fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}
fn default_sync_interval_ms() -> u64 {
    DEFAULT_SYNC_INTERVAL_MS
}
fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}
fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}
fn default_history_journal_window() -> usize {
    DEFAULT_HISTORY_JOURNAL_WINDOW
}
fn default_transaction_history() -> usize {
    DEFAULT_TRANSACTION_HISTORY
}
fn default_quota_threshold() -> f64 {
    DEFAULT_QUOTA_THRESHOLD_PERCENT
}
fn default_storage_budget() -> u64 {
    DEFAULT_STORAGE_BUDGET_BYTES
}
fn default_provider() -> ProviderKind {
    ProviderKind::Gist
}
fn default_gist() -> ProviderConfig {
    ProviderConfig {
        enabled: false,
        base_url: "https://api.github.com".to_string(),
    }
}
fn default_jsonbin() -> ProviderConfig {
    ProviderConfig {
        enabled: false,
        base_url: "https://api.jsonbin.io/v3".to_string(),
    }
}
fn default_sync_config() -> SyncConfig {
    SyncConfig {
        active_provider: default_provider(),
        interval_ms: DEFAULT_SYNC_INTERVAL_MS,
        request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        gist: default_gist(),
        jsonbin: default_jsonbin(),
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        default_sync_config()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            history_journal_window: DEFAULT_HISTORY_JOURNAL_WINDOW,
            transaction_history: DEFAULT_TRANSACTION_HISTORY,
            quota_threshold_percent: DEFAULT_QUOTA_THRESHOLD_PERCENT,
            storage_budget_bytes: DEFAULT_STORAGE_BUDGET_BYTES,
            sync: SyncConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn provider(&self, kind: ProviderKind) -> Option<&ProviderConfig> {
        match kind {
            ProviderKind::Gist => Some(&self.gist),
            ProviderKind::JsonBin => Some(&self.jsonbin),
            ProviderKind::Memory => None,
        }
    }

    /// The active provider, if it is enabled. `Memory` is always enabled.
    pub fn enabled_provider(&self) -> Option<ProviderKind> {
        match self.provider(self.active_provider) {
            Some(provider) if !provider.enabled => None,
            _ => Some(self.active_provider),
        }
    }
}

impl EngineConfig {
    /// Configuration rooted at `data_dir`, loaded from its config file if present.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| PomoflowError::FileReadError {
                path: path.clone(),
                source: e,
            })?;
            serde_json::from_str::<EngineConfig>(&content)?
        } else {
            EngineConfig::default()
        };
        config.data_dir = data_dir.to_path_buf();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Write this configuration into its data directory.
    pub fn save(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.data_dir).map_err(|e| PomoflowError::FileWriteError {
            path: self.data_dir.clone(),
            source: e,
        })?;
        let path = self.data_dir.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&path, content).map_err(|e| PomoflowError::FileWriteError {
            path: path.clone(),
            source: e,
        })?;
        Ok(path)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = env::var("POMOFLOW_DEBOUNCE_MS") {
            self.debounce_ms = parse_env("POMOFLOW_DEBOUNCE_MS", &value)?;
        }
        if let Ok(value) = env::var("POMOFLOW_SYNC_INTERVAL_MS") {
            self.sync.interval_ms = parse_env("POMOFLOW_SYNC_INTERVAL_MS", &value)?;
        }
        if let Ok(value) = env::var("POMOFLOW_PROVIDER") {
            self.sync.active_provider =
                ProviderKind::from_str(&value).ok_or_else(|| PomoflowError::Config {
                    reason: format!("POMOFLOW_PROVIDER: unknown provider '{}'", value),
                })?;
        }
        if let Ok(value) = env::var("POMOFLOW_DATA_DIR") {
            self.data_dir = PathBuf::from(value);
        }
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let reject = |reason: &str| {
            Err(PomoflowError::Config {
                reason: reason.to_string(),
            })
        };
        if self.debounce_ms == 0 {
            return reject("debounce_ms must be greater than zero");
        }
        if self.sync.interval_ms == 0 {
            return reject("sync.interval_ms must be greater than zero");
        }
        if self.history_capacity == 0 {
            return reject("history_capacity must be greater than zero");
        }
        if self.transaction_history == 0 {
            return reject("transaction_history must be greater than zero");
        }
        if !(self.quota_threshold_percent > 0.0 && self.quota_threshold_percent <= 100.0) {
            return reject("quota_threshold_percent must be in (0, 100]");
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn primary_store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    pub fn backup_store_file(&self) -> PathBuf {
        self.data_dir.join("backup.json")
    }

    pub fn history_journal_file(&self) -> PathBuf {
        self.data_dir.join("history.json")
    }

    pub fn sync_state_file(&self) -> PathBuf {
        self.data_dir.join("sync_state.json")
    }

    pub fn local_settings_file(&self) -> PathBuf {
        self.data_dir.join("local_settings.json")
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| PomoflowError::Config {
        reason: format!("{}: cannot parse '{}'", name, value),
    })
}
