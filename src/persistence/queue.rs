//! Debounced, transactional write-back queue.
//!
//! Mutations enqueue operations; once the debounce window passes without a
//! new enqueue, everything pending is written to both backends as one
//! transaction.
//!
//! The queue spawns its timer with [`tokio::task::spawn_local`], so
//! [`PersistenceQueue::queue_operation`] must run inside a
//! [`tokio::task::LocalSet`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{
    EngineConfig, DEFAULT_DEBOUNCE_MS, DEFAULT_QUOTA_THRESHOLD_PERCENT, DEFAULT_TRANSACTION_HISTORY,
};
use crate::error::{PomoflowError, Result};
use crate::persistence::backend::StorageBackend;
use crate::persistence::quota::QuotaProbe;
use crate::persistence::stats::{OperationResult, PersistenceStats, TransactionReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Save,
    Update,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Save => f.write_str("save"),
            OperationKind::Update => f.write_str("update"),
            OperationKind::Delete => f.write_str("delete"),
        }
    }
}

/// A write waiting for the next transaction.
#[derive(Debug, Clone)]
pub struct PersistenceOperation {
    pub id: String,
    pub kind: OperationKind,
    pub key: String,
    /// Document to write; ignored for deletes.
    pub payload: Json,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub debounce: Duration,
    /// Number of transaction reports retained.
    pub transaction_history: usize,
    pub quota_threshold_percent: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            transaction_history: DEFAULT_TRANSACTION_HISTORY,
            quota_threshold_percent: DEFAULT_QUOTA_THRESHOLD_PERCENT,
        }
    }
}

impl From<&EngineConfig> for QueueConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            debounce: config.debounce(),
            transaction_history: config.transaction_history,
            quota_threshold_percent: config.quota_threshold_percent,
        }
    }
}

/// Callback fired after a transaction with at least one successful write.
pub type SyncTrigger = Rc<dyn Fn()>;

struct QueueInner {
    config: QueueConfig,
    primary: Rc<dyn StorageBackend>,
    backup: Rc<dyn StorageBackend>,
    quota: Option<Rc<dyn QuotaProbe>>,
    pending: RefCell<Vec<PersistenceOperation>>,
    timer: RefCell<Option<JoinHandle<()>>>,
    stats: RefCell<PersistenceStats>,
    transactions: RefCell<VecDeque<TransactionReport>>,
    sync_trigger: RefCell<Option<SyncTrigger>>,
}

/// Handle to the write-back queue. Clones share the same queue.
#[derive(Clone)]
pub struct PersistenceQueue {
    inner: Rc<QueueInner>,
}

impl PersistenceQueue {
    pub fn new(
        config: QueueConfig,
        primary: Rc<dyn StorageBackend>,
        backup: Rc<dyn StorageBackend>,
    ) -> Self {
        Self::build(config, primary, backup, None)
    }

    /// Like [`PersistenceQueue::new`], checking storage usage before every
    /// transaction.
    pub fn with_quota(
        config: QueueConfig,
        primary: Rc<dyn StorageBackend>,
        backup: Rc<dyn StorageBackend>,
        quota: Rc<dyn QuotaProbe>,
    ) -> Self {
        Self::build(config, primary, backup, Some(quota))
    }

    fn build(
        config: QueueConfig,
        primary: Rc<dyn StorageBackend>,
        backup: Rc<dyn StorageBackend>,
        quota: Option<Rc<dyn QuotaProbe>>,
    ) -> Self {
        Self {
            inner: Rc::new(QueueInner {
                config,
                primary,
                backup,
                quota,
                pending: RefCell::new(Vec::new()),
                timer: RefCell::new(None),
                stats: RefCell::new(PersistenceStats::default()),
                transactions: RefCell::new(VecDeque::new()),
                sync_trigger: RefCell::new(None),
            }),
        }
    }

    /// Enqueue a write and (re)start the debounce timer. Returns the
    /// operation id.
    pub fn queue_operation(
        &self,
        kind: OperationKind,
        key: impl Into<String>,
        payload: Json,
    ) -> String {
        let operation = PersistenceOperation {
            id: Uuid::new_v4().to_string(),
            kind,
            key: key.into(),
            payload,
            enqueued_at: Utc::now(),
        };
        let id = operation.id.clone();
        debug!(op = %id, kind = %operation.kind, key = %operation.key, "Queued operation");
        self.inner.pending.borrow_mut().push(operation);
        self.schedule();
        id
    }

    fn schedule(&self) {
        self.cancel_timer();
        let inner = self.inner.clone();
        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep(inner.config.debounce).await;
            // Once fired this task is no longer cancellable.
            inner.timer.borrow_mut().take();
            if let Err(e) = inner.run_transaction().await {
                warn!(error = %e, "Debounced transaction aborted");
            }
        });
        *self.inner.timer.borrow_mut() = Some(handle);
    }

    fn cancel_timer(&self) {
        if let Some(handle) = self.inner.timer.borrow_mut().take() {
            handle.abort();
        }
    }

    /// Write everything pending now and wait for the result.
    pub async fn flush_queue(&self) -> Result<TransactionReport> {
        self.cancel_timer();
        self.inner.run_transaction().await
    }

    /// Drop every pending operation without writing it. Returns how many
    /// were dropped.
    pub fn clear_queue(&self) -> usize {
        self.cancel_timer();
        let dropped = std::mem::take(&mut *self.inner.pending.borrow_mut()).len();
        warn!(dropped, "Cleared persistence queue without writing");
        dropped
    }

    pub fn set_sync_trigger(&self, trigger: SyncTrigger) {
        *self.inner.sync_trigger.borrow_mut() = Some(trigger);
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    /// Whether a debounce timer is armed.
    pub fn is_scheduled(&self) -> bool {
        self.inner.timer.borrow().is_some()
    }

    pub fn stats(&self) -> PersistenceStats {
        self.inner.stats.borrow().clone()
    }

    /// Retained transaction reports, oldest first.
    pub fn recent_transactions(&self) -> Vec<TransactionReport> {
        self.inner.transactions.borrow().iter().cloned().collect()
    }
}

impl QueueInner {
    async fn run_transaction(&self) -> Result<TransactionReport> {
        let operations = std::mem::take(&mut *self.pending.borrow_mut());
        let id = Uuid::new_v4().to_string();
        let timestamp = Utc::now();
        let started = Instant::now();

        if operations.is_empty() {
            return Ok(TransactionReport::new(id, timestamp, Vec::new(), Duration::ZERO, None));
        }

        if let Some(quota) = &self.quota {
            match quota.estimate().await {
                Ok(estimate) if estimate.exceeds(self.config.quota_threshold_percent) => {
                    let err = PomoflowError::QuotaExceeded {
                        used: estimate.used,
                        total: estimate.total,
                        percentage: estimate.percentage(),
                    };
                    warn!(tx = %id, ops = operations.len(), error = %err, "Transaction aborted before writing");
                    let results = operations
                        .iter()
                        .map(|op| OperationResult {
                            operation_id: op.id.clone(),
                            kind: op.kind,
                            key: op.key.clone(),
                            succeeded: false,
                            error: None,
                        })
                        .collect();
                    let report = TransactionReport::new(
                        id,
                        timestamp,
                        results,
                        started.elapsed(),
                        Some(err.to_string()),
                    );
                    self.stats.borrow_mut().record_quota_abort();
                    self.retain(report);
                    return Err(err);
                }
                Ok(_) => {}
                Err(e) => warn!(tx = %id, error = %e, "Quota probe failed, writing anyway"),
            }
        }

        let results = join_all(operations.iter().map(|op| self.execute(op))).await;
        let report = TransactionReport::new(id, timestamp, results, started.elapsed(), None);

        if report.is_success() {
            info!(tx = %report.id, ops = report.attempted(), duration_ms = report.duration.as_millis() as u64, "Transaction committed");
        } else {
            warn!(
                tx = %report.id,
                ops = report.attempted(),
                failed = report.failed(),
                error = report.error.as_deref().unwrap_or_default(),
                "Transaction incomplete"
            );
        }

        let fire_sync = report.succeeded() > 0;
        self.retain(report.clone());

        if fire_sync {
            let trigger = self.sync_trigger.borrow().clone();
            if let Some(trigger) = trigger {
                trigger();
            }
        }
        Ok(report)
    }

    /// Write one operation to both backends concurrently.
    async fn execute(&self, op: &PersistenceOperation) -> OperationResult {
        let (primary, backup) = futures::join!(
            apply(self.primary.as_ref(), op),
            apply(self.backup.as_ref(), op)
        );
        let errors: Vec<String> = [primary, backup]
            .into_iter()
            .filter_map(|r| r.err())
            .map(|e| e.to_string())
            .collect();
        OperationResult {
            operation_id: op.id.clone(),
            kind: op.kind,
            key: op.key.clone(),
            succeeded: errors.is_empty(),
            error: (!errors.is_empty()).then(|| errors.join("; ")),
        }
    }

    fn retain(&self, report: TransactionReport) {
        self.stats.borrow_mut().record(&report);
        let mut transactions = self.transactions.borrow_mut();
        transactions.push_back(report);
        while transactions.len() > self.config.transaction_history {
            transactions.pop_front();
        }
    }
}

async fn apply(backend: &dyn StorageBackend, op: &PersistenceOperation) -> Result<()> {
    match op.kind {
        OperationKind::Save | OperationKind::Update => backend.save(&op.key, &op.payload).await,
        OperationKind::Delete => backend.delete(&op.key).await,
    }
}
