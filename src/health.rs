use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use hive_worker_job::{Job, JobError, JobStatus, WorkerStatus};
use tracing::{error, warn};

use crate::errors::Result;
use crate::retry::{FailureOutcome, RetryManager};
use crate::store::{JobStore, WorkerFilter};

/// Result of one [`HealthMonitor::check`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Workers flagged unhealthy by this check
    pub unhealthy_workers: Vec<String>,
    /// In-flight jobs of those workers that were failed
    pub failed_jobs: usize,
}

/// Flags workers whose heartbeat went stale and fails the jobs they held.
#[derive(Clone)]
pub struct HealthMonitor {
    store: Arc<dyn JobStore>,
    retry: RetryManager,
    unhealthy_after: Duration,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn JobStore>, unhealthy_after: Duration) -> Self {
        Self {
            retry: RetryManager::new(store.clone()),
            store,
            unhealthy_after,
        }
    }

    pub async fn check(&self, now: DateTime<Utc>) -> Result<HealthReport> {
        let stale_before = now - self.unhealthy_after;
        let mut report = HealthReport::default();

        let workers = self.store.list_workers(&WorkerFilter::default()).await?;
        for worker in workers {
            if *worker.status() == WorkerStatus::Unhealthy
                || !worker.is_stale(now, self.unhealthy_after)
            {
                continue;
            }
            // Only the monitor that flips the status fails the jobs.
            let Some(worker) = self
                .store
                .mark_worker_unhealthy(worker.id(), stale_before)
                .await?
            else {
                continue;
            };
            warn!(
                worker_id = worker.id(),
                last_heartbeat = %worker.last_heartbeat(),
                "Worker missed heartbeats, marked unhealthy"
            );

            let reason = format!("worker {} missed heartbeats", worker.id());
            report.failed_jobs += self
                .fail_in_flight_jobs(worker.id(), worker.current_job_ids(), &reason, now)
                .await;
            report.unhealthy_workers.push(worker.id().clone());
        }

        Ok(report)
    }

    /// Fails every job still `running` under `worker_id`, be it reported in
    /// `reported_job_ids` or only locked by the worker. Returns how many jobs
    /// were failed. Errors are logged per job.
    pub(crate) async fn fail_in_flight_jobs(
        &self,
        worker_id: &str,
        reported_job_ids: &[i64],
        reason: &str,
        now: DateTime<Utc>,
    ) -> usize {
        let mut jobs: BTreeMap<i64, Job> = BTreeMap::new();
        match self.store.running_jobs_locked_by(worker_id).await {
            Ok(locked) => jobs.extend(locked.into_iter().map(|job| (job.id(), job))),
            Err(e) => error!(worker_id, error = %e, "Could not load jobs locked by worker"),
        }
        match self.store.get_jobs(reported_job_ids).await {
            Ok(reported) => {
                for job in reported {
                    if job.status() == JobStatus::Running
                        && job.locked_by().as_deref() == Some(worker_id)
                    {
                        jobs.entry(job.id()).or_insert(job);
                    }
                }
            }
            Err(e) => error!(worker_id, error = %e, "Could not load jobs reported by worker"),
        }

        let mut failed = 0;
        for job in jobs.values() {
            let Some(lease) = job.lease() else {
                continue;
            };
            match self
                .retry
                .handle_failure(job, &lease, JobError::new(reason), now)
                .await
            {
                Ok(FailureOutcome::Discarded) => {}
                Ok(_) => failed += 1,
                Err(e) => error!(job_id = job.id(), worker_id, error = %e, "Could not fail job"),
            }
        }
        failed
    }
}
