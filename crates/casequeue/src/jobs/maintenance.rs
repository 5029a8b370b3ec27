use crate::error::Result;
use crate::jobs::model::JobCategory;
use crate::jobs::store::JobStore;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{error, info};

/// Deletes `completed` jobs once they are older than their category's
/// retention window. `failed` jobs are never touched.
#[derive(Clone)]
pub struct RetentionSweeper {
    store: Arc<dyn JobStore>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: Vec<(JobCategory, u64)>,
}

impl SweepReport {
    pub fn total(&self) -> u64 {
        self.deleted.iter().map(|(_, n)| n).sum()
    }
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for category in JobCategory::ALL {
            let cutoff = now - category.retention();
            let n = self
                .store
                .delete_completed_before(cutoff, Some(category))
                .await?;
            if n > 0 {
                info!(category = %category, deleted = n, "retention sweep removed completed jobs");
            }
            report.deleted.push((category, n));
        }
        Ok(report)
    }

    /// Sweep every `interval` until the task is dropped or aborted.
    pub async fn run(self, interval: std::time::Duration) {
        loop {
            if let Err(e) = self.sweep(Utc::now()).await {
                error!(error = %e, "retention sweep failed");
            }
            tokio::time::sleep(interval).await;
        }
    }
}

/// Convenience: compute cutoff like "now - N days"
pub fn cutoff_days(days: i64) -> DateTime<Utc> {
    Utc::now() - Duration::days(days)
}
