//! Local configuration storage.
//!
//! A small string key/value file, the place provider credentials live.
//! Values are read from memory; `set` and `remove` write through to disk.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{PomoflowError, Result};

/// Key holding the GitHub token used by the gist provider.
pub const GIST_TOKEN_KEY: &str = "gist_token";

/// Key holding the JSONBin master key.
pub const JSONBIN_KEY_KEY: &str = "jsonbin_api_key";

#[derive(Debug, Default)]
pub struct LocalSettings {
    path: Option<PathBuf>,
    values: RefCell<BTreeMap<String, String>>,
}

impl LocalSettings {
    /// Settings that live only in memory.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open settings backed by `path`. A missing or unreadable file yields
    /// empty settings; an unreadable one is logged.
    pub fn open(path: &Path) -> Self {
        let values = match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(values) => values,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring unreadable local settings");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self {
            path: Some(path.to_path_buf()),
            values: RefCell::new(values),
        }
    }

    /// Look up a value; blank strings count as absent.
    pub fn get(&self, key: &str) -> Option<String> {
        self.values
            .borrow()
            .get(key)
            .filter(|v| !v.trim().is_empty())
            .cloned()
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        self.flush()
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.values.borrow_mut().remove(key);
        self.flush()
    }

    fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| PomoflowError::FileWriteError {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let content = serde_json::to_string_pretty(&*self.values.borrow())?;
        fs::write(path, content).map_err(|e| PomoflowError::FileWriteError {
            path: path.clone(),
            source: e,
        })
    }
}
