//! Error types for the Pomoflow engine.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for Pomoflow operations.
pub type Result<T> = std::result::Result<T, PomoflowError>;

/// Errors that can occur in history, persistence and sync.
#[derive(Error, Debug)]
pub enum PomoflowError {
    // Validation Errors
    #[error("Validation failed: {reason}")]
    Validation { reason: String },

    #[error("Item not found in {collection}: {id}")]
    ItemNotFound { collection: String, id: String },

    #[error("Item already exists in {collection}: {id}")]
    DuplicateItem { collection: String, id: String },

    // Persistence Errors
    #[error("Storage quota exceeded: {percentage:.1}% used ({used} of {total} bytes)")]
    QuotaExceeded {
        used: u64,
        total: u64,
        percentage: f64,
    },

    #[error("Transaction {transaction_id} incomplete: {failed} of {attempted} operations failed")]
    PartialTransaction {
        transaction_id: String,
        attempted: usize,
        failed: usize,
    },

    #[error("Storage backend '{backend}' failed for key '{key}': {reason}")]
    Storage {
        backend: String,
        key: String,
        reason: String,
    },

    #[error("Failed to read file: {path}: {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file: {path}: {source}")]
    FileWriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Sync Errors
    #[error("No credential configured for sync provider '{provider}'")]
    CredentialMissing { provider: String },

    #[error("Network error talking to '{provider}': {message}")]
    Network { provider: String, message: String },

    #[error("Provider '{provider}' returned HTTP {status}")]
    RemoteStatus { provider: String, status: u16 },

    #[error("Provider '{provider}' returned an unreadable payload: {reason}")]
    RemoteFormat { provider: String, reason: String },

    #[error("Sync skipped: device is offline")]
    SyncOffline,

    #[error("Sync skipped: another sync is in progress")]
    SyncInProgress,

    // Configuration Errors
    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    // Generic Errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PomoflowError {
    /// Get the error code for this error type
    pub fn error_code(&self) -> &'static str {
        match self {
            PomoflowError::Validation { .. } => "VALIDATION_ERROR",
            PomoflowError::ItemNotFound { .. } => "ITEM_NOT_FOUND",
            PomoflowError::DuplicateItem { .. } => "DUPLICATE_ITEM",
            PomoflowError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            PomoflowError::PartialTransaction { .. } => "PARTIAL_TRANSACTION",
            PomoflowError::Storage { .. } => "STORAGE_ERROR",
            PomoflowError::FileReadError { .. } => "FILE_READ_ERROR",
            PomoflowError::FileWriteError { .. } => "FILE_WRITE_ERROR",
            PomoflowError::CredentialMissing { .. } => "CREDENTIAL_MISSING",
            PomoflowError::Network { .. } => "NETWORK_ERROR",
            PomoflowError::RemoteStatus { .. } => "REMOTE_STATUS",
            PomoflowError::RemoteFormat { .. } => "REMOTE_FORMAT",
            PomoflowError::SyncOffline => "SYNC_OFFLINE",
            PomoflowError::SyncInProgress => "SYNC_IN_PROGRESS",
            PomoflowError::Config { .. } => "CONFIG_ERROR",
            PomoflowError::Json(_) => "SERIALIZATION_ERROR",
            PomoflowError::Io(_) => "IO_ERROR",
        }
    }

    /// Returns true if this error indicates the operation can be retried.
    ///
    /// A missing credential is not transient: it disables the provider until
    /// the user configures one.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PomoflowError::Network { .. }
                | PomoflowError::RemoteStatus { .. }
                | PomoflowError::SyncInProgress
                | PomoflowError::SyncOffline
                | PomoflowError::Storage { .. }
                | PomoflowError::FileWriteError { .. }
        )
    }

    /// Returns a user-friendly recovery suggestion.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            PomoflowError::QuotaExceeded { .. } => {
                Some("Free local storage or archive completed tasks before saving again.")
            }
            PomoflowError::CredentialMissing { .. } => {
                Some("Set a provider credential with 'pomoflow-cli set-credential'.")
            }
            PomoflowError::Network { .. } | PomoflowError::RemoteStatus { .. } => {
                Some("Changes are kept locally; sync will retry on the next interval.")
            }
            PomoflowError::PartialTransaction { .. } => {
                Some("Some writes did not reach every store; the next save rewrites them.")
            }
            PomoflowError::SyncOffline => Some("Reconnect to sync; local edits are preserved."),
            _ => None,
        }
    }
}
