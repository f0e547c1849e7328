//! On-disk journal of recent history entries, so undo survives a restart.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::{PomoflowError, Result};
use crate::history::manager::{EntryMetadata, HistoryEntry};
use crate::state::codec;

const JOURNAL_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct JournalFile {
    version: u32,
    saved_at: DateTime<Utc>,
    entries: Vec<JournalEntry>,
    /// Undone entries, in redo-stack order.
    #[serde(default)]
    redo: Vec<JournalEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JournalEntry {
    id: String,
    timestamp: DateTime<Utc>,
    label: String,
    snapshot: Json,
    #[serde(default)]
    metadata: EntryMetadata,
}

impl JournalEntry {
    fn encode(entry: &HistoryEntry) -> Self {
        Self {
            id: entry.id.clone(),
            timestamp: entry.timestamp,
            label: entry.label.clone(),
            snapshot: codec::encode(&entry.snapshot),
            metadata: entry.metadata.clone(),
        }
    }

    fn decode(self) -> Result<HistoryEntry> {
        Ok(HistoryEntry {
            id: self.id,
            timestamp: self.timestamp,
            label: self.label,
            snapshot: codec::decode(&self.snapshot)?,
            metadata: self.metadata,
        })
    }
}

/// What a journal holds: both stacks, oldest first.
#[derive(Debug, Default)]
pub struct JournalContents {
    pub past: Vec<HistoryEntry>,
    pub future: Vec<HistoryEntry>,
}

#[derive(Debug, Clone)]
pub struct HistoryJournal {
    path: PathBuf,
}

impl HistoryJournal {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the journal with the `past` and `future` windows, both in
    /// stack order.
    pub fn write(&self, past: &[&HistoryEntry], future: &[&HistoryEntry]) -> Result<()> {
        let file = JournalFile {
            version: JOURNAL_VERSION,
            saved_at: Utc::now(),
            entries: past.iter().map(|e| JournalEntry::encode(e)).collect(),
            redo: future.iter().map(|e| JournalEntry::encode(e)).collect(),
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| PomoflowError::FileWriteError {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let content = serde_json::to_string(&file)?;
        fs::write(&self.path, content).map_err(|e| PomoflowError::FileWriteError {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Read both stacks back. A missing journal is empty.
    pub fn read(&self) -> Result<JournalContents> {
        if !self.path.exists() {
            return Ok(JournalContents::default());
        }
        let content = fs::read_to_string(&self.path).map_err(|e| PomoflowError::FileReadError {
            path: self.path.clone(),
            source: e,
        })?;
        let file: JournalFile = serde_json::from_str(&content)?;
        if file.version != JOURNAL_VERSION {
            return Err(PomoflowError::Validation {
                reason: format!("unsupported history journal version {}", file.version),
            });
        }

        Ok(JournalContents {
            past: file
                .entries
                .into_iter()
                .map(JournalEntry::decode)
                .collect::<Result<_>>()?,
            future: file
                .redo
                .into_iter()
                .map(JournalEntry::decode)
                .collect::<Result<_>>()?,
        })
    }

    pub fn remove(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path).map_err(|e| PomoflowError::FileWriteError {
                path: self.path.clone(),
                source: e,
            })?;
        }
        Ok(())
    }
}
