//! Durable write-back of store mutations.
//!
//! - [`PersistenceQueue`]: debounced batching into transactions
//! - [`StorageBackend`]: the primary and backup key/value stores
//! - [`QuotaProbe`]: storage usage checked before each transaction

pub mod backend;
pub mod queue;
pub mod quota;
pub mod stats;

pub use backend::{load_latest, DirectoryStore, FlatFileStore, MemoryStore, StorageBackend};
pub use queue::{
    OperationKind, PersistenceOperation, PersistenceQueue, QueueConfig, SyncTrigger,
};
pub use quota::{DirectoryQuota, FixedQuota, QuotaEstimate, QuotaProbe};
pub use stats::{OperationResult, PersistenceStats, TransactionOutcome, TransactionReport};
