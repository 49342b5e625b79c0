use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{try_join, StreamExt};
use getset::Getters;
use hive_worker_ctx::JobContext;
use hive_worker_job::{Job, JobError, JobStatus, Lease, Transition, WorkerRecord, WorkerStatus};
use hive_worker_shutdown_signal::{ShutdownSignal, ShutdownTrigger};
use hive_worker_task_handler::{spawn_task, RunTaskError, SpawnTaskResult, TaskOutput};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::builder::WorkerOptions;
use crate::dispatcher::{DispatchedJob, Dispatcher};
use crate::errors::HiveWorkerError;
use crate::health::HealthMonitor;
use crate::in_flight::InFlight;
use crate::retention::RetentionSweeper;
use crate::retry::RetryManager;
use crate::store::JobStore;
use crate::streams::{dispatched_job_receiver_stream, dispatched_job_stream, tick_stream};
use crate::worker_utils::WorkerUtils;

/// How long in-flight handlers may keep running after shutdown was
/// requested before they are aborted.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// A registered handler: takes the job context and runs the job.
pub type WorkerFn = Box<
    dyn Fn(JobContext) -> Pin<Box<dyn Future<Output = Result<TaskOutput, RunTaskError>> + Send>>
        + Send
        + Sync,
>;

/// A worker process: dispatches jobs of the types it has handlers for,
/// executes them, heartbeats, and runs the health and retention sweeps.
#[derive(Getters)]
#[getset(get = "pub")]
pub struct Worker {
    pub(crate) worker_id: String,
    pub(crate) environment: String,
    pub(crate) concurrency: usize,
    pub(crate) poll_interval: Duration,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) health_check_interval: Duration,
    pub(crate) retention_interval: Duration,
    /// Heartbeat age after which a worker is considered unhealthy
    pub(crate) unhealthy_after: chrono::Duration,
    pub(crate) jobs: HashMap<String, WorkerFn>,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) shutdown_signal: ShutdownSignal,
    #[getset(skip)]
    pub(crate) shutdown_trigger: ShutdownTrigger,
    #[getset(skip)]
    pub(crate) record: Mutex<WorkerRecord>,
    #[getset(skip)]
    pub(crate) in_flight: Arc<InFlight>,
    #[getset(skip)]
    pub(crate) dispatcher: Dispatcher,
    #[getset(skip)]
    pub(crate) retry: RetryManager,
    /// Notified whenever a job releases its slot
    #[getset(skip)]
    pub(crate) slot_freed: Arc<Notify>,
}

#[derive(Error, Debug)]
pub enum WorkerRuntimeError {
    #[error("Unexpected error occured while processing job : '{0}'")]
    ReleaseJob(#[from] ReleaseJobError),
    #[error("Store error : '{0}'")]
    Store(#[from] HiveWorkerError),
}

impl Worker {
    pub fn options() -> WorkerOptions {
        WorkerOptions::default()
    }

    /// Runs until the shutdown signal resolves.
    ///
    /// Dispatching, execution, heartbeats, health checks and retention sweeps
    /// run as independent loops. On shutdown, dispatching stops first and
    /// in-flight jobs get [`SHUTDOWN_GRACE_PERIOD`] to finish before they are
    /// aborted and failed.
    pub async fn run(&self) -> Result<(), WorkerRuntimeError> {
        info!(
            worker_id = self.worker_id,
            environment = self.environment,
            concurrency = self.concurrency,
            job_types = ?self.jobs.keys().collect::<Vec<_>>(),
            "Worker started"
        );

        let (sender, receiver) = mpsc::channel(self.concurrency);
        try_join!(
            self.dispatch_loop(sender),
            self.execute_loop(receiver),
            self.heartbeat_loop(),
            self.health_loop(),
            self.retention_loop(),
        )?;

        self.heartbeat(WorkerStatus::Idle).await?;
        info!(worker_id = self.worker_id, "Worker stopped");
        Ok(())
    }

    /// Dispatches and executes jobs until none is eligible, then returns.
    ///
    /// Jobs unblocked or retried with no delay while the pass runs are picked
    /// up as well. No heartbeat, health check or sweep is run.
    pub async fn run_once(&self) -> Result<(), WorkerRuntimeError> {
        loop {
            let processed = std::sync::atomic::AtomicUsize::new(0);
            dispatched_job_stream(&self.dispatcher, self.shutdown_signal.clone())
                .for_each_concurrent(self.concurrency, |dispatched| {
                    let processed = &processed;
                    async move {
                        let job_id = dispatched.job.id();
                        match run_and_release_job(dispatched, self).await {
                            Ok(()) => debug!(job_id, "Job processed"),
                            Err(e) => error!("Error while processing job : {:?}", e),
                        }
                        processed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    }
                })
                .await;

            if processed.into_inner() == 0 || self.shutdown_trigger.is_triggered() {
                return Ok(());
            }
        }
    }

    pub fn create_utils(&self) -> WorkerUtils {
        WorkerUtils::new(self.store.clone()).with_unhealthy_after(self.unhealthy_after)
    }

    /// Asks `run`/`run_once` to stop: no new jobs are dispatched and in-flight
    /// jobs get the shutdown grace period.
    pub fn request_shutdown(&self) {
        self.shutdown_trigger.trigger();
    }

    async fn dispatch_loop(
        &self,
        sender: mpsc::Sender<DispatchedJob>,
    ) -> Result<(), WorkerRuntimeError> {
        let ticks = tick_stream(
            self.poll_interval,
            Some(self.slot_freed.clone()),
            self.shutdown_signal.clone(),
        );
        futures::pin_mut!(ticks);

        while let Some(source) = ticks.next().await {
            let dispatched = match self.dispatcher.dispatch(Utc::now()).await {
                Ok(dispatched) => dispatched,
                Err(e) => {
                    error!(?source, error = %e, "Could not dispatch jobs");
                    continue;
                }
            };
            for job in dispatched {
                // The executor only goes away once this loop ends.
                if sender.send(job).await.is_err() {
                    return Ok(());
                }
            }
        }
        debug!(worker_id = self.worker_id, "Dispatch loop stopped");
        Ok(())
    }

    async fn execute_loop(
        &self,
        receiver: mpsc::Receiver<DispatchedJob>,
    ) -> Result<(), WorkerRuntimeError> {
        dispatched_job_receiver_stream(receiver)
            .for_each_concurrent(self.concurrency, |dispatched| async move {
                let job_id = dispatched.job.id();
                match run_and_release_job(dispatched, self).await {
                    Ok(()) => debug!(job_id, "Job processed"),
                    Err(e) => error!("Error while processing job : {:?}", e),
                }
            })
            .await;
        Ok(())
    }

    async fn heartbeat_loop(&self) -> Result<(), WorkerRuntimeError> {
        let ticks = tick_stream(self.heartbeat_interval, None, self.shutdown_signal.clone());
        futures::pin_mut!(ticks);

        while ticks.next().await.is_some() {
            let status = if self.in_flight.total() > 0 {
                WorkerStatus::Busy
            } else {
                WorkerStatus::Idle
            };
            if let Err(e) = self.heartbeat(status).await {
                error!(worker_id = self.worker_id, error = %e, "Could not send heartbeat");
                continue;
            }
            if let Err(e) = self.cancel_revoked_jobs().await {
                error!(worker_id = self.worker_id, error = %e, "Could not check running jobs");
            }
        }

        if let Err(e) = self.heartbeat(WorkerStatus::Draining).await {
            error!(worker_id = self.worker_id, error = %e, "Could not send heartbeat");
        }
        Ok(())
    }

    async fn health_loop(&self) -> Result<(), WorkerRuntimeError> {
        let monitor = HealthMonitor::new(self.store.clone(), self.unhealthy_after);
        let ticks = tick_stream(
            self.health_check_interval,
            None,
            self.shutdown_signal.clone(),
        );
        futures::pin_mut!(ticks);

        while ticks.next().await.is_some() {
            if let Err(e) = monitor.check(Utc::now()).await {
                error!(error = %e, "Health check failed");
            }
        }
        Ok(())
    }

    async fn retention_loop(&self) -> Result<(), WorkerRuntimeError> {
        let sweeper = RetentionSweeper::new(self.store.clone());
        let ticks = tick_stream(self.retention_interval, None, self.shutdown_signal.clone());
        futures::pin_mut!(ticks);

        while ticks.next().await.is_some() {
            if let Err(e) = sweeper.sweep(Utc::now()).await {
                error!(error = %e, "Retention sweep failed");
            }
        }
        Ok(())
    }

    /// Persists this worker's status and in-flight job ids.
    pub(crate) async fn heartbeat(&self, status: WorkerStatus) -> Result<(), HiveWorkerError> {
        let mut record = self.record.lock().await;
        record.record_heartbeat(status, self.in_flight.job_ids(), Utc::now());
        self.store.upsert_worker(&record).await
    }

    /// Triggers the cancellation token of in-flight jobs that are no longer
    /// running under this worker (cancelled, or failed by a health check).
    async fn cancel_revoked_jobs(&self) -> Result<(), HiveWorkerError> {
        let ids = self.in_flight.job_ids();
        if ids.is_empty() {
            return Ok(());
        }
        for job in self.store.get_jobs(&ids).await? {
            let still_ours = job.status() == JobStatus::Running
                && job.locked_by().as_deref() == Some(self.worker_id.as_str());
            if !still_ours && self.in_flight.cancel(job.id()) {
                info!(
                    job_id = job.id(),
                    status = %job.status(),
                    "Job no longer running on this worker, cancellation requested"
                );
            }
        }
        Ok(())
    }
}

/// Executes a claimed job and records its outcome. The job's slot is released
/// once the outcome is stored.
async fn run_and_release_job(
    dispatched: DispatchedJob,
    worker: &Worker,
) -> Result<(), ReleaseJobError> {
    let DispatchedJob {
        job,
        cancellation_token,
        slot,
    } = dispatched;

    let SpawnTaskResult { duration, result } = run_job(&job, worker, cancellation_token).await;
    let released = release_job(result, &job, worker, duration).await;

    drop(slot);
    worker.slot_freed.notify_one();

    released.map_err(|e| {
        error!("Release job error : {:?}", e);
        e
    })
}

#[tracing::instrument(
    "run_job",
    skip(job, worker, cancellation_token),
    fields(
        job_id = job.id(),
        job_type = %job.job_type(),
        queue = %job.queue(),
        attempt = job.attempts(),
    )
)]
async fn run_job(
    job: &Job,
    worker: &Worker,
    cancellation_token: CancellationToken,
) -> SpawnTaskResult {
    let Some(task_fn) = worker.jobs.get(job.job_type()) else {
        return SpawnTaskResult {
            duration: Duration::ZERO,
            result: Err(RunTaskError::TaskError(format!(
                "No handler registered for job type '{}'",
                job.job_type()
            ))),
        };
    };

    let ctx = JobContext::new(job.clone(), worker.worker_id.clone(), cancellation_token);
    let task_fut = task_fn(ctx).instrument(Span::current());
    let deadline = Duration::from_secs(job.timeout_seconds().max(1) as u64);

    // Once shutdown is requested the handler gets a grace period, then it is
    // aborted.
    let abort_token = CancellationToken::new();
    let shutdown_signal = worker.shutdown_signal.clone();
    let shutdown_timeout = {
        let abort_token = abort_token.clone();
        async move {
            shutdown_signal.await;
            tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;
            abort_token.cancel();
        }
    };

    let task = spawn_task(task_fut, deadline, abort_token);
    futures::pin_mut!(task);
    tokio::select! {
        res = &mut task => res,
        _ = shutdown_timeout => {
            warn!(
                job_id = job.id(),
                job_type = job.job_type(),
                "Job interrupted by shutdown signal after {}s grace period",
                SHUTDOWN_GRACE_PERIOD.as_secs()
            );
            task.await
        }
    }
}

#[derive(Error, Debug)]
#[error("Failed to release job '{job_id}'. {source}")]
pub struct ReleaseJobError {
    job_id: i64,
    #[source]
    source: HiveWorkerError,
}

/// Turns a handler error into what gets recorded on the job: the first line
/// as `last_error` and the full text as trace when there is more.
fn job_error(error: &RunTaskError) -> JobError {
    let text = match error {
        RunTaskError::TaskError(message) => message.clone(),
        other => other.to_string(),
    };
    let mut lines = text.lines();
    let message = lines.next().unwrap_or_default().trim().to_string();
    if lines.any(|line| !line.trim().is_empty()) {
        JobError::new(message).with_trace(text)
    } else {
        JobError::new(message)
    }
}

async fn release_job(
    job_result: Result<TaskOutput, RunTaskError>,
    job: &Job,
    worker: &Worker,
    duration: Duration,
) -> Result<(), ReleaseJobError> {
    let now: DateTime<Utc> = Utc::now();
    let to_release_error = |source| ReleaseJobError {
        job_id: job.id(),
        source,
    };
    // Outcomes only land on the attempt this worker claimed
    let lease = Lease::new(worker.worker_id.as_str(), job.attempts());

    match job_result {
        Ok(output) => {
            let transition = Transition::Complete {
                result: output,
                at: now,
            };
            let completed = worker
                .store
                .transition(job.id(), &transition, Some(&lease))
                .await
                .map_err(to_release_error)?;
            match completed {
                Some(_) => info!(
                    job_id = job.id(),
                    job_type = job.job_type(),
                    queue = job.queue(),
                    duration = duration.as_millis(),
                    "Completed job with success"
                ),
                None => warn!(
                    job_id = job.id(),
                    "Job changed status while running, result discarded"
                ),
            }
        }
        Err(e) if !e.is_retryable() => {
            let transition = Transition::Fail {
                error: job_error(&e),
                at: now,
            };
            let failed = worker
                .store
                .transition(job.id(), &transition, Some(&lease))
                .await
                .map_err(to_release_error)?;
            if failed.is_some() {
                error!(
                    job_id = job.id(),
                    job_type = job.job_type(),
                    error = %e,
                    "Job failed without retry"
                );
            }
        }
        Err(e) => {
            worker
                .retry
                .handle_failure(job, &lease, job_error(&e), now)
                .await
                .map_err(to_release_error)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_error_keeps_first_line_as_message() {
        let err = job_error(&RunTaskError::TaskError(
            "connection refused\n\nCaused by:\n    os error 111".to_string(),
        ));
        assert_eq!(err.message, "connection refused");
        assert!(err.trace.unwrap().contains("os error 111"));

        let err = job_error(&RunTaskError::TaskTimedOut(Duration::from_secs(3)));
        assert_eq!(err.message, "Task exceeded its deadline of 3s");
        assert_eq!(err.trace, None);
    }
}
