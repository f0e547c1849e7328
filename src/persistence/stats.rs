//! Transaction reports and running persistence statistics.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{PomoflowError, Result};
use crate::persistence::queue::OperationKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionOutcome {
    /// Every operation reached both backends.
    Success,
    /// Some operations failed; the rest were kept.
    Partial,
    /// Nothing succeeded, or the transaction was aborted before writing.
    Failed,
}

/// Result of one operation inside a transaction.
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult {
    pub operation_id: String,
    pub kind: OperationKind,
    pub key: String,
    pub succeeded: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionReport {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub operations: Vec<OperationResult>,
    pub outcome: TransactionOutcome,
    #[serde(skip)]
    pub duration: Duration,
    pub error: Option<String>,
}

impl TransactionReport {
    pub(crate) fn new(
        id: String,
        timestamp: DateTime<Utc>,
        operations: Vec<OperationResult>,
        duration: Duration,
        error: Option<String>,
    ) -> Self {
        let failed = operations.iter().filter(|op| !op.succeeded).count();
        let outcome = if failed == 0 && error.is_none() {
            TransactionOutcome::Success
        } else if failed < operations.len() {
            TransactionOutcome::Partial
        } else {
            TransactionOutcome::Failed
        };
        let error = error.or_else(|| {
            operations
                .iter()
                .find_map(|op| op.error.as_ref())
                .map(|e| e.to_string())
        });
        Self {
            id,
            timestamp,
            operations,
            outcome,
            duration,
            error,
        }
    }

    pub fn attempted(&self) -> usize {
        self.operations.len()
    }

    pub fn succeeded(&self) -> usize {
        self.operations.iter().filter(|op| op.succeeded).count()
    }

    pub fn failed(&self) -> usize {
        self.attempted() - self.succeeded()
    }

    pub fn is_success(&self) -> bool {
        self.outcome == TransactionOutcome::Success
    }

    /// Turn a partial or failed transaction into an error, for callers that
    /// need every write to have landed.
    pub fn ensure_complete(&self) -> Result<()> {
        if self.is_success() {
            return Ok(());
        }
        Err(PomoflowError::PartialTransaction {
            transaction_id: self.id.clone(),
            attempted: self.attempted(),
            failed: self.failed(),
        })
    }
}

/// Running totals across every transaction since the queue was created.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PersistenceStats {
    pub transactions: u64,
    pub operations_attempted: u64,
    pub operations_succeeded: u64,
    pub operations_failed: u64,
    pub quota_aborts: u64,
    /// Mean wall time per transaction, in milliseconds.
    pub avg_transaction_ms: f64,
    pub last_error: Option<String>,
    pub last_transaction_at: Option<DateTime<Utc>>,
}

impl PersistenceStats {
    pub(crate) fn record(&mut self, report: &TransactionReport) {
        self.transactions += 1;
        self.operations_attempted += report.attempted() as u64;
        self.operations_succeeded += report.succeeded() as u64;
        self.operations_failed += report.failed() as u64;

        let ms = report.duration.as_secs_f64() * 1000.0;
        self.avg_transaction_ms += (ms - self.avg_transaction_ms) / self.transactions as f64;

        if report.error.is_some() {
            self.last_error = report.error.clone();
        }
        self.last_transaction_at = Some(report.timestamp);
    }

    pub(crate) fn record_quota_abort(&mut self) {
        self.quota_aborts += 1;
    }

    /// Share of attempted operations that succeeded, 0-1.
    pub fn success_rate(&self) -> f64 {
        if self.operations_attempted == 0 {
            return 1.0;
        }
        self.operations_succeeded as f64 / self.operations_attempted as f64
    }
}
