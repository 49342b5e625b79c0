use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use hive_worker_job::{JobStatus, Queue};
use tracing::{debug, error, info};

use crate::errors::Result;
use crate::store::JobStore;

/// Dispatches older than this no longer count towards any rate limit.
const DISPATCH_WINDOW_HOURS: i64 = 1;

/// Number of jobs removed by a [`RetentionSweeper::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub completed: u64,
    /// `failed`, `dead_lettered` and `cancelled` jobs
    pub failed: u64,
}

impl SweepReport {
    pub fn total(&self) -> u64 {
        self.completed + self.failed
    }
}

/// Deletes terminal jobs older than their queue's retention window, and
/// dispatch records no rate-limit window can see anymore.
#[derive(Clone)]
pub struct RetentionSweeper {
    store: Arc<dyn JobStore>,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Sweeps every queue, inactive ones included. A failing queue is logged
    /// and skipped.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for queue in self.store.list_queues().await? {
            match self.sweep_queue(&queue, now).await {
                Ok(swept) => {
                    report.completed += swept.completed;
                    report.failed += swept.failed;
                }
                Err(e) => error!(queue = queue.name(), error = %e, "Retention sweep failed"),
            }
        }

        match self
            .store
            .prune_dispatches(now - Duration::hours(DISPATCH_WINDOW_HOURS))
            .await
        {
            Ok(0) => {}
            Ok(pruned) => debug!(pruned, "Pruned expired dispatch records"),
            Err(e) => error!(error = %e, "Could not prune dispatch records"),
        }

        if report.total() > 0 {
            info!(
                completed = report.completed,
                failed = report.failed,
                "Purged expired jobs"
            );
        }
        Ok(report)
    }

    async fn sweep_queue(&self, queue: &Queue, now: DateTime<Utc>) -> Result<SweepReport> {
        let completed = self
            .store
            .delete_terminal_jobs(
                queue.name(),
                &[JobStatus::Completed],
                now - Duration::hours(queue.retention_completed_hours().into()),
            )
            .await?;
        let failed = self
            .store
            .delete_terminal_jobs(
                queue.name(),
                JobStatus::UNSUCCESSFUL,
                now - Duration::hours(queue.retention_failed_hours().into()),
            )
            .await?;
        Ok(SweepReport { completed, failed })
    }
}
