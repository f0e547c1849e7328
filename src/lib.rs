//! Pomoflow - State history, durable write-back and cloud sync engine
//!
//! Pomoflow sits underneath a personal task manager's live store and provides:
//! 1. Undo/Redo - bounded history of whole-state snapshots
//! 2. Persistence - debounced, quota-aware transactions to two local stores
//! 3. Cloud Sync - upload to a remote blob store and merge newer remote state
//!
//! # Architecture
//!
//! The engine is single-threaded: every component is driven from a tokio
//! `LocalSet` and shared through `Rc`.
//! - [`store::TaskStore`] holds the live state and enqueues writes
//! - [`history::HistoryManager`] snapshots it before each change
//! - [`persistence::PersistenceQueue`] batches the writes
//! - [`sync::SyncCoordinator`] reconciles with the remote

pub mod cli;
pub mod config;
pub mod error;
pub mod history;
pub mod persistence;
pub mod settings;
pub mod state;
pub mod store;
pub mod sync;
pub mod workspace;

pub use config::EngineConfig;
pub use error::{PomoflowError, Result};
pub use workspace::Workspace;
