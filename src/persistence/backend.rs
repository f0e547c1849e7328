//! Local durable key/value backends.
//!
//! The queue writes every operation to two of these: a primary structured
//! store and a flat backup. Keys look like `tasks/<id>`, `projects/<id>` or
//! `settings`; values are arbitrary JSON documents.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use crate::error::{PomoflowError, Result};

/// Extension for documents written by [`DirectoryStore`].
const DOCUMENT_EXTENSION: &str = ".json";

#[async_trait(?Send)]
pub trait StorageBackend {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Insert or overwrite `key`.
    async fn save(&self, key: &str, value: &Json) -> Result<()>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Every stored key and value, for rehydration.
    async fn load_all(&self) -> Result<BTreeMap<String, Json>>;
}

fn storage_error(backend: &str, key: &str, reason: impl std::fmt::Display) -> PomoflowError {
    PomoflowError::Storage {
        backend: backend.to_string(),
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

/// Primary store: one JSON document per key inside a directory.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, key: &str) -> PathBuf {
        self.root
            .join(format!("{}{}", encode_key(key), DOCUMENT_EXTENSION))
    }
}

/// Escape a key into a single safe file name.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[async_trait(?Send)]
impl StorageBackend for DirectoryStore {
    fn name(&self) -> &str {
        "primary"
    }

    async fn save(&self, key: &str, value: &Json) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| storage_error(self.name(), key, e))?;
        let content = serde_json::to_vec(value)?;
        tokio::fs::write(self.document_path(key), content)
            .await
            .map_err(|e| storage_error(self.name(), key, e))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.document_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error(self.name(), key, e)),
        }
    }

    async fn load_all(&self) -> Result<BTreeMap<String, Json>> {
        let mut records = BTreeMap::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(storage_error(self.name(), "*", e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| storage_error(self.name(), "*", e))?
        {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(stem) = file_name.strip_suffix(DOCUMENT_EXTENSION) else {
                continue;
            };
            let Some(key) = decode_key(stem) else {
                warn!(file = %file_name, "Skipping document with undecodable name");
                continue;
            };
            let content = tokio::fs::read(entry.path())
                .await
                .map_err(|e| storage_error(self.name(), &key, e))?;
            let value = serde_json::from_slice(&content)
                .map_err(|e| storage_error(self.name(), &key, e))?;
            records.insert(key, value);
        }
        debug!(backend = self.name(), count = records.len(), "Loaded documents");
        Ok(records)
    }
}

/// Backup store: every key in one JSON file, rewritten on each change.
#[derive(Debug)]
pub struct FlatFileStore {
    path: PathBuf,
    cache: RefCell<Option<BTreeMap<String, Json>>>,
}

impl FlatFileStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            cache: RefCell::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(&self) -> Result<BTreeMap<String, Json>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path).map_err(|e| PomoflowError::FileReadError {
            path: self.path.clone(),
            source: e,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Apply `change` to a copy of the contents and rewrite the file. The
    /// cache only takes the copy once the write has landed.
    fn modify(&self, key: &str, change: impl FnOnce(&mut BTreeMap<String, Json>)) -> Result<()> {
        let cached = self.cache.borrow().clone();
        let mut records = match cached {
            Some(records) => records,
            None => self.read_file().unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "Backup store unreadable, rewriting");
                BTreeMap::new()
            }),
        };
        change(&mut records);

        let content = serde_json::to_string(&records)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| storage_error(self.name(), key, e))?;
        }
        fs::write(&self.path, content).map_err(|e| storage_error(self.name(), key, e))?;
        *self.cache.borrow_mut() = Some(records);
        Ok(())
    }
}

#[async_trait(?Send)]
impl StorageBackend for FlatFileStore {
    fn name(&self) -> &str {
        "backup"
    }

    async fn save(&self, key: &str, value: &Json) -> Result<()> {
        self.modify(key, |records| {
            records.insert(key.to_string(), value.clone());
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.modify(key, |records| {
            records.remove(key);
        })
    }

    async fn load_all(&self) -> Result<BTreeMap<String, Json>> {
        if let Some(records) = self.cache.borrow().as_ref() {
            return Ok(records.clone());
        }
        let records = self.read_file()?;
        *self.cache.borrow_mut() = Some(records.clone());
        Ok(records)
    }
}

/// In-process store with failure injection and artificial latency.
#[derive(Debug, Default)]
pub struct MemoryStore {
    name: String,
    records: RefCell<BTreeMap<String, Json>>,
    failing_keys: RefCell<HashSet<String>>,
    fail_all: Cell<bool>,
    latency: Cell<Option<Duration>>,
    writes: Cell<usize>,
}

impl MemoryStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Make every write to `key` fail.
    pub fn fail_key(&self, key: &str) {
        self.failing_keys.borrow_mut().insert(key.to_string());
    }

    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.set(fail);
    }

    /// Delay every write by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.latency.set(latency);
    }

    /// Number of write attempts, failed ones included.
    pub fn write_count(&self) -> usize {
        self.writes.get()
    }

    pub fn get(&self, key: &str) -> Option<Json> {
        self.records.borrow().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.borrow().is_empty()
    }

    async fn before_write(&self, key: &str) -> Result<()> {
        self.writes.set(self.writes.get() + 1);
        if let Some(latency) = self.latency.get() {
            tokio::time::sleep(latency).await;
        }
        if self.fail_all.get() || self.failing_keys.borrow().contains(key) {
            return Err(storage_error(&self.name, key, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl StorageBackend for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn save(&self, key: &str, value: &Json) -> Result<()> {
        self.before_write(key).await?;
        self.records
            .borrow_mut()
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.before_write(key).await?;
        self.records.borrow_mut().remove(key);
        Ok(())
    }

    async fn load_all(&self) -> Result<BTreeMap<String, Json>> {
        if self.fail_all.get() {
            return Err(storage_error(&self.name, "*", "injected failure"));
        }
        Ok(self.records.borrow().clone())
    }
}

/// Rehydrate from the primary store, falling back to the backup when the
/// primary is unreadable or empty.
pub async fn load_latest(
    primary: &dyn StorageBackend,
    backup: &dyn StorageBackend,
) -> Result<BTreeMap<String, Json>> {
    match primary.load_all().await {
        Ok(records) if !records.is_empty() => {
            info!(backend = primary.name(), count = records.len(), "Rehydrated state");
            return Ok(records);
        }
        Ok(_) => debug!(backend = primary.name(), "Primary store empty, trying backup"),
        Err(e) => warn!(backend = primary.name(), error = %e, "Primary store unreadable, trying backup"),
    }

    let records = backup.load_all().await?;
    if !records.is_empty() {
        info!(backend = backup.name(), count = records.len(), "Rehydrated state from backup");
    }
    Ok(records)
}
