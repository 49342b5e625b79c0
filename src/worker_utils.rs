use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use getset::{CopyGetters, Getters};
use hive_worker_job::{
    default_unhealthy_after, Job, JobStatus, NewJob, Queue, Transition, WorkerRecord,
};
use hive_worker_task_handler::TaskHandler;
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::dependency::validate_dependencies;
use crate::errors::{HiveWorkerError, Result, ValidationError};
use crate::health::HealthMonitor;
use crate::job_spec::JobSpec;
use crate::queues::QueueRegistry;
use crate::retention::{RetentionSweeper, SweepReport};
use crate::store::{JobFilter, JobStore, WorkerFilter};

/// Maintenance tasks run by [`WorkerUtils::cleanup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupTask {
    /// Runs a retention sweep right away instead of waiting for a worker's
    /// next one.
    PurgeExpiredJobs,
    /// Deletes `unhealthy` worker records whose last heartbeat is older than
    /// `older_than`.
    GcDeadWorkers { older_than: Duration },
}

/// What a [`WorkerUtils::cleanup`] call removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub purged_jobs: SweepReport,
    pub deleted_workers: u64,
}

impl CleanupTask {
    pub async fn execute(&self, store: &Arc<dyn JobStore>) -> Result<CleanupReport> {
        let now = Utc::now();
        let mut report = CleanupReport::default();
        match self {
            CleanupTask::PurgeExpiredJobs => {
                report.purged_jobs = RetentionSweeper::new(store.clone()).sweep(now).await?;
            }
            CleanupTask::GcDeadWorkers { older_than } => {
                let older_than = chrono::Duration::from_std(*older_than)
                    .map_err(|e| HiveWorkerError::Store(e.to_string()))?;
                report.deleted_workers = store.delete_dead_workers(now - older_than).await?;
            }
        }
        Ok(report)
    }
}

/// A worker record with its derived health.
#[derive(Getters, CopyGetters, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerInfo {
    #[getset(get = "pub")]
    record: WorkerRecord,
    #[getset(get_copy = "pub")]
    is_healthy: bool,
}

/// Control surface of the job engine: enqueue, inspect, cancel and retry
/// jobs, manage queues, list workers.
#[derive(Clone)]
pub struct WorkerUtils {
    store: Arc<dyn JobStore>,
    registry: QueueRegistry,
    unhealthy_after: chrono::Duration,
}

impl WorkerUtils {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            registry: QueueRegistry::new(store.clone()),
            store,
            unhealthy_after: default_unhealthy_after(),
        }
    }

    /// Heartbeat age after which [`WorkerUtils::list_workers`] reports a
    /// worker as unhealthy.
    pub fn with_unhealthy_after(mut self, unhealthy_after: chrono::Duration) -> Self {
        self.unhealthy_after = unhealthy_after;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Adds a job handled by `T`.
    ///
    /// ```
    /// # use hive_worker::{IntoTaskHandlerResult, JobContext, JobSpec, TaskHandler, WorkerUtils};
    /// # use hive_worker::errors::HiveWorkerError;
    /// # use serde::{Deserialize, Serialize};
    /// # #[derive(Deserialize, Serialize)]
    /// # struct SendInvoice { invoice_id: i64 }
    /// # impl TaskHandler for SendInvoice {
    /// #     const IDENTIFIER: &'static str = "send_invoice";
    /// #     async fn run(self, _ctx: JobContext) -> impl IntoTaskHandlerResult { Ok::<(), String>(()) }
    /// # }
    /// # async fn example(utils: &WorkerUtils) -> Result<(), HiveWorkerError> {
    /// let job = utils
    ///     .add_job(SendInvoice { invoice_id: 7 }, JobSpec::default())
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    #[tracing::instrument("add_job", skip_all, fields(job_type = T::IDENTIFIER))]
    pub async fn add_job<T: TaskHandler>(&self, payload: T, spec: JobSpec) -> Result<Job> {
        let payload = serde_json::to_value(payload)?;
        self.insert_job(T::IDENTIFIER, payload, spec).await
    }

    /// Adds a job by type name with any serializable payload.
    #[tracing::instrument("add_raw_job", skip_all, fields(job_type = job_type))]
    pub async fn add_raw_job<P>(&self, job_type: &str, payload: P, spec: JobSpec) -> Result<Job>
    where
        P: Serialize,
    {
        let payload = serde_json::to_value(payload)?;
        self.insert_job(job_type, payload, spec).await
    }

    /// Validates the job against its queue and dependencies, applies the
    /// queue's defaults and persists it. Nothing is written when validation
    /// fails.
    async fn insert_job(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        spec: JobSpec,
    ) -> Result<Job> {
        if job_type.trim().is_empty() {
            return Err(ValidationError::EmptyJobType.into());
        }

        let queue_name = spec
            .queue
            .as_deref()
            .unwrap_or(Queue::DEFAULT_QUEUE_NAME);
        let (queue, priority) = self.registry.admit(queue_name, spec.priority).await?;

        let max_attempts = spec.max_attempts.unwrap_or(queue.default_max_attempts());
        if max_attempts <= 0 {
            return Err(ValidationError::InvalidJobSpec(format!(
                "max_attempts must be positive, got {max_attempts}"
            ))
            .into());
        }
        let timeout_seconds = match spec.timeout {
            Some(timeout) => i32::try_from(timeout.as_secs()).unwrap_or(i32::MAX),
            None => queue.default_timeout_seconds(),
        };
        if timeout_seconds <= 0 {
            return Err(
                ValidationError::InvalidJobSpec("timeout must be at least 1 second".into()).into(),
            );
        }

        let mut depends_on = spec.depends_on.clone().unwrap_or_default();
        depends_on.sort_unstable();
        depends_on.dedup();
        validate_dependencies(self.store.as_ref(), None, &depends_on).await?;

        let now = Utc::now();
        let scheduled_at = spec.resolve_scheduled_at(now);
        let status = if scheduled_at > now {
            JobStatus::Scheduled
        } else {
            JobStatus::Pending
        };

        let job = self
            .store
            .insert_job(NewJob {
                job_type: job_type.to_string(),
                payload,
                queue: queue.name().clone(),
                priority,
                status,
                max_attempts,
                timeout_seconds,
                depends_on,
                parent_job_id: spec.parent_job_id,
                scheduled_at,
                context: spec.context.unwrap_or_else(|| json!({})),
                created_by: spec.created_by.unwrap_or_default(),
                tenant_id: spec.tenant_id,
            })
            .await?;

        info!(
            job_id = job.id(),
            job_type,
            queue = job.queue(),
            priority = %job.priority(),
            status = %job.status(),
            "Job added"
        );
        Ok(job)
    }

    pub async fn get_job(&self, id: i64) -> Result<Job> {
        self.store
            .get_job(id)
            .await?
            .ok_or(HiveWorkerError::JobNotFound(id))
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.store.list_jobs(filter).await
    }

    /// Cancels a non-terminal job. Returns `false` when the job does not
    /// exist or already reached a terminal status.
    ///
    /// A running handler keeps running until it notices its cancellation
    /// token, which its worker triggers on its next heartbeat.
    pub async fn cancel_job(&self, id: i64) -> Result<bool> {
        let cancelled = self
            .store
            .transition(id, &Transition::Cancel { at: Utc::now() }, None)
            .await?;
        if cancelled.is_some() {
            info!(job_id = id, "Job cancelled");
        }
        Ok(cancelled.is_some())
    }

    /// Puts a `failed` or `dead_lettered` job back to `pending` with a fresh
    /// attempt budget. Returns `false` for any other status.
    pub async fn retry_job(&self, id: i64) -> Result<bool> {
        let requeued = self
            .store
            .transition(id, &Transition::Requeue { at: Utc::now() }, None)
            .await?;
        if requeued.is_some() {
            info!(job_id = id, "Job requeued");
        }
        Ok(requeued.is_some())
    }

    /// Validates and persists a queue built with [`Queue::builder`].
    pub async fn create_queue(&self, queue: Queue) -> Result<Queue> {
        self.registry.create_queue(queue).await
    }

    pub async fn get_queue(&self, name: &str) -> Result<Queue> {
        self.registry.get_queue(name).await
    }

    pub async fn list_queues(&self) -> Result<Vec<Queue>> {
        self.registry.list_queues().await
    }

    pub async fn list_workers(&self, filter: &WorkerFilter) -> Result<Vec<WorkerInfo>> {
        let now = Utc::now();
        Ok(self
            .store
            .list_workers(filter)
            .await?
            .into_iter()
            .map(|record| WorkerInfo {
                is_healthy: record.is_healthy(now, self.unhealthy_after),
                record,
            })
            .collect())
    }

    /// Fails, through the retry path, every job still running under one of
    /// `worker_ids`. Meant for workers known to be gone. Returns the number
    /// of jobs failed.
    pub async fn force_unlock_workers(&self, worker_ids: &[&str]) -> Result<usize> {
        let monitor = HealthMonitor::new(self.store.clone(), self.unhealthy_after);
        let workers = self.store.list_workers(&WorkerFilter::default()).await?;
        let now = Utc::now();

        let mut failed = 0;
        for worker_id in worker_ids {
            let reported = workers
                .iter()
                .find(|w| w.id() == worker_id)
                .map(|w| w.current_job_ids().clone())
                .unwrap_or_default();
            let reason = format!("worker {worker_id} was force-unlocked");
            failed += monitor
                .fail_in_flight_jobs(worker_id, &reported, &reason, now)
                .await;
        }
        info!(workers = ?worker_ids, failed, "Force-unlocked workers");
        Ok(failed)
    }

    /// Runs the given maintenance tasks in order.
    ///
    /// ```
    /// # use hive_worker::WorkerUtils;
    /// # use hive_worker::worker_utils::CleanupTask;
    /// # use hive_worker::errors::HiveWorkerError;
    /// # use std::time::Duration;
    /// # async fn example(utils: &WorkerUtils) -> Result<(), HiveWorkerError> {
    /// utils
    ///     .cleanup(&[
    ///         CleanupTask::PurgeExpiredJobs,
    ///         CleanupTask::GcDeadWorkers { older_than: Duration::from_secs(86_400) },
    ///     ])
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn cleanup(&self, tasks: &[CleanupTask]) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        for task in tasks {
            let done = task.execute(&self.store).await?;
            report.purged_jobs.completed += done.purged_jobs.completed;
            report.purged_jobs.failed += done.purged_jobs.failed;
            report.deleted_workers += done.deleted_workers;
        }
        Ok(report)
    }

    /// Installs or upgrades the store's schema. Workers do this on init.
    pub async fn migrate(&self) -> Result<()> {
        self.store.migrate().await
    }
}
