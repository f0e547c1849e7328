//! Undo/redo history over whole-state snapshots.

pub mod journal;
pub mod manager;

pub use journal::{HistoryJournal, JournalContents};
pub use manager::{
    EntryMetadata, HistoryConfig, HistoryEntry, HistoryManager, HistoryStack, SnapshotTarget,
    REQUIRED_DOMAINS,
};
