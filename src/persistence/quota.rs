//! Storage quota estimation.

use std::cell::Cell;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use walkdir::WalkDir;

use crate::error::{PomoflowError, Result};

/// Bytes used against bytes available.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaEstimate {
    pub used: u64,
    pub total: u64,
}

impl QuotaEstimate {
    /// Share of the budget in use, 0-100. An unknown (zero) total reads as 0.
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.used as f64 * 100.0 / self.total as f64
    }

    pub fn exceeds(&self, threshold_percent: f64) -> bool {
        self.percentage() > threshold_percent
    }
}

#[async_trait(?Send)]
pub trait QuotaProbe {
    async fn estimate(&self) -> Result<QuotaEstimate>;
}

/// Sums the size of the files under the store paths against a fixed budget.
#[derive(Debug, Clone)]
pub struct DirectoryQuota {
    paths: Vec<PathBuf>,
    budget_bytes: u64,
}

impl DirectoryQuota {
    pub fn new(paths: &[&Path], budget_bytes: u64) -> Self {
        Self {
            paths: paths.iter().map(|p| p.to_path_buf()).collect(),
            budget_bytes,
        }
    }

    fn used_bytes(&self) -> u64 {
        self.paths
            .iter()
            .filter(|path| path.exists())
            .flat_map(|path| WalkDir::new(path).into_iter().filter_map(|e| e.ok()))
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.metadata().ok())
            .map(|metadata| metadata.len())
            .sum()
    }
}

#[async_trait(?Send)]
impl QuotaProbe for DirectoryQuota {
    async fn estimate(&self) -> Result<QuotaEstimate> {
        Ok(QuotaEstimate {
            used: self.used_bytes(),
            total: self.budget_bytes,
        })
    }
}

/// A quota that reports whatever it is told to.
#[derive(Debug, Default)]
pub struct FixedQuota {
    used: Cell<u64>,
    total: Cell<u64>,
    unavailable: Cell<bool>,
}

impl FixedQuota {
    pub fn new(used: u64, total: u64) -> Self {
        Self {
            used: Cell::new(used),
            total: Cell::new(total),
            unavailable: Cell::new(false),
        }
    }

    pub fn set_usage(&self, used: u64) {
        self.used.set(used);
    }

    /// Make the probe itself fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.set(unavailable);
    }
}

#[async_trait(?Send)]
impl QuotaProbe for FixedQuota {
    async fn estimate(&self) -> Result<QuotaEstimate> {
        if self.unavailable.get() {
            return Err(PomoflowError::Storage {
                backend: "quota".to_string(),
                key: "*".to_string(),
                reason: "storage estimate unavailable".to_string(),
            });
        }
        Ok(QuotaEstimate {
            used: self.used.get(),
            total: self.total.get(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use tempfile::tempdir;

    #[test]
    fn test_percentage() {
        let estimate = QuotaEstimate {
            used: 96,
            total: 100,
        };
        assert_relative_eq!(estimate.percentage(), 96.0);
        assert!(estimate.exceeds(95.0));
        assert!(!QuotaEstimate { used: 95, total: 100 }.exceeds(95.0));
    }

    #[test]
    fn test_zero_total_never_exceeds() {
        let estimate = QuotaEstimate { used: 10, total: 0 };
        assert!(!estimate.exceeds(95.0));
    }

    #[tokio::test]
    async fn test_directory_quota_counts_file_sizes() {
        let temp = tempdir().unwrap();
        let store = temp.path().join("store");
        std::fs::create_dir_all(&store).unwrap();
        std::fs::write(store.join("a.json"), vec![b'x'; 300]).unwrap();
        std::fs::write(temp.path().join("backup.json"), vec![b'y'; 200]).unwrap();

        let backup = temp.path().join("backup.json");
        let absent = temp.path().join("absent");
        let quota = DirectoryQuota::new(&[store.as_path(), backup.as_path(), absent.as_path()], 1000);
        let estimate = quota.estimate().await.unwrap();
        assert_eq!(estimate.used, 500);
        assert_relative_eq!(estimate.percentage(), 50.0);
    }
}
