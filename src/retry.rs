use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use hive_worker_job::{Job, JobError, JobStatus, Lease, NewJob, Queue, Transition};
use serde_json::{json, Value};
use tracing::{error, warn};

use crate::errors::Result;
use crate::store::JobStore;

/// Delay before re-attempting a job that failed on its `attempts`-th try:
/// `min(base × 2^(attempts − 1), max)` seconds.
pub fn backoff_delay(attempts: i16, base_seconds: i64, max_seconds: i64) -> Duration {
    let exponent = (attempts.max(1) - 1) as u32;
    let seconds = 2i64
        .checked_pow(exponent)
        .and_then(|factor| base_seconds.checked_mul(factor))
        .unwrap_or(i64::MAX)
        .min(max_seconds);
    Duration::seconds(seconds)
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    Retrying {
        run_at: DateTime<Utc>,
    },
    DeadLettered {
        /// Copy enqueued on the queue's dead-letter queue, if it has one
        dead_letter_job_id: Option<i64>,
    },
    /// The attempt is no longer held under the given lease (the job was
    /// cancelled, or requeued and claimed again) and the failure was not
    /// applied.
    Discarded,
}

/// Applies the queue's retry policy to failed attempts and routes exhausted
/// jobs to the dead-letter queue.
#[derive(Clone)]
pub struct RetryManager {
    store: Arc<dyn JobStore>,
}

impl RetryManager {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Records a failed attempt of a `running` job held under `lease`. The
    /// attempt budget is judged on the leased attempt, which the store only
    /// accepts while that attempt is still the current one.
    pub async fn handle_failure(
        &self,
        job: &Job,
        lease: &Lease,
        error: JobError,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome> {
        if !lease.holds(job) {
            return Ok(FailureOutcome::Discarded);
        }

        let queue = self.store.get_queue(job.queue()).await?;
        let dead_letter_after = queue.as_ref().and_then(|q| q.dead_letter_after_attempts());

        if !job.attempts_exhausted(dead_letter_after) {
            let (base, max) = queue
                .as_ref()
                .map(|q| (q.retry_delay_base_seconds(), q.retry_delay_max_seconds()))
                .unwrap_or((60, 3600));
            let run_at = now + backoff_delay(job.attempts(), base, max);
            let transition = Transition::Retry {
                run_at,
                error: error.clone(),
                at: now,
            };
            if self
                .store
                .transition(job.id(), &transition, Some(lease))
                .await?
                .is_none()
            {
                return Ok(FailureOutcome::Discarded);
            }
            warn!(
                job_id = job.id(),
                queue = job.queue(),
                job_type = job.job_type(),
                attempts = job.attempts(),
                max_attempts = job.max_attempts(),
                error = error.message,
                %run_at,
                "Failed job, will retry"
            );
            return Ok(FailureOutcome::Retrying { run_at });
        }

        let transition = Transition::DeadLetter {
            error: error.clone(),
            at: now,
        };
        let Some(dead) = self
            .store
            .transition(job.id(), &transition, Some(lease))
            .await?
        else {
            return Ok(FailureOutcome::Discarded);
        };
        error!(
            job_id = job.id(),
            queue = job.queue(),
            job_type = job.job_type(),
            attempts = job.attempts(),
            error = error.message,
            "Job attempts exhausted, dead-lettered"
        );

        let dead_letter_job_id = match queue.as_ref() {
            Some(queue) => self.enqueue_dead_letter(&dead, queue, &error).await?,
            None => None,
        };
        Ok(FailureOutcome::DeadLettered { dead_letter_job_id })
    }

    /// Copies `job` to the queue's dead-letter queue for inspection. The copy
    /// is stored `dead_lettered`, so no worker runs it until an operator
    /// replays it with `retry_job`. It bypasses the active check.
    async fn enqueue_dead_letter(
        &self,
        job: &Job,
        queue: &Queue,
        error: &JobError,
    ) -> Result<Option<i64>> {
        let Some(dlq_name) = queue.dead_letter_queue_name() else {
            return Ok(None);
        };
        let Some(dlq) = self.store.get_queue(dlq_name).await? else {
            warn!(
                job_id = job.id(),
                queue = queue.name(),
                dead_letter_queue = dlq_name,
                "Dead-letter queue does not exist, dropping copy"
            );
            return Ok(None);
        };

        let priority = if dlq.allows_priority(job.priority()) {
            job.priority()
        } else {
            dlq.default_priority()
        };

        let copy = self
            .store
            .insert_job(NewJob {
                job_type: job.job_type().clone(),
                payload: job.payload().clone(),
                queue: dlq.name().clone(),
                priority,
                status: JobStatus::DeadLettered,
                max_attempts: dlq.default_max_attempts(),
                timeout_seconds: job.timeout_seconds(),
                depends_on: Vec::new(),
                parent_job_id: Some(job.id()),
                scheduled_at: Utc::now(),
                context: dead_letter_context(job, error),
                created_by: job.created_by().clone(),
                tenant_id: job.tenant_id().clone(),
            })
            .await?;

        warn!(
            job_id = job.id(),
            dead_letter_job_id = copy.id(),
            dead_letter_queue = dlq.name(),
            "Job copied to dead-letter queue"
        );
        Ok(Some(copy.id()))
    }
}

/// The original context with a `dead_letter` entry describing the failure.
fn dead_letter_context(job: &Job, error: &JobError) -> Value {
    let entry = json!({
        "original_job_id": job.id(),
        "queue": job.queue(),
        "attempts": job.attempts(),
        "error": error.message,
    });
    match job.context() {
        Value::Object(map) => {
            let mut map = map.clone();
            map.insert("dead_letter".to_string(), entry);
            Value::Object(map)
        }
        Value::Null => json!({ "dead_letter": entry }),
        other => json!({ "original": other, "dead_letter": entry }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryJobStore;

    #[test]
    fn backoff_doubles_until_capped() {
        let delays: Vec<i64> = (1..=7)
            .map(|attempts| backoff_delay(attempts, 60, 3600).num_seconds())
            .collect();
        assert_eq!(delays, vec![60, 120, 240, 480, 960, 1920, 3600]);
        assert_eq!(backoff_delay(i16::MAX, 60, 3600).num_seconds(), 3600);
        assert_eq!(backoff_delay(0, 60, 3600).num_seconds(), 60);
    }

    async fn running_job(store: &MemoryJobStore, queue: Queue, max_attempts: i16) -> Job {
        store.create_queue(queue.clone()).await.unwrap();
        let job = Job::builder()
            .id(1)
            .job_type("charge")
            .queue(queue.name().clone())
            .max_attempts(max_attempts)
            .context(json!({ "request_id": "r1" }))
            .build();
        store.put_job(job).await;
        store.claim_job(1, "w", Utc::now()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn failure_with_budget_left_is_retried_later() {
        let store = Arc::new(MemoryJobStore::new());
        let job = running_job(&store, Queue::builder("billing").build(), 3).await;
        let lease = job.lease().unwrap();
        let retry = RetryManager::new(store.clone());

        let now = Utc::now();
        let outcome = retry
            .handle_failure(&job, &lease, JobError::new("card declined"), now)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FailureOutcome::Retrying {
                run_at: now + Duration::seconds(60)
            }
        );

        let stored = store.get_job(1).await.unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::Retrying);
        assert_eq!(stored.last_error(), &Some("card declined".to_string()));
        assert_eq!(stored.locked_by(), &None);
    }

    #[tokio::test]
    async fn exhausted_job_is_copied_to_dead_letter_queue() {
        let store = Arc::new(MemoryJobStore::new());
        store
            .create_queue(Queue::builder("billing_dlq").is_active(false).build())
            .await
            .unwrap();
        let queue = Queue::builder("billing")
            .dead_letter_queue_name("billing_dlq")
            .build();
        let job = running_job(&store, queue, 1).await;
        let lease = job.lease().unwrap();
        let retry = RetryManager::new(store.clone());

        let outcome = retry
            .handle_failure(&job, &lease, JobError::new("boom"), Utc::now())
            .await
            .unwrap();
        let FailureOutcome::DeadLettered {
            dead_letter_job_id: Some(copy_id),
        } = outcome
        else {
            panic!("expected a dead-letter copy, got {outcome:?}");
        };

        let original = store.get_job(1).await.unwrap().unwrap();
        assert_eq!(original.status(), JobStatus::DeadLettered);
        assert!(original.completed_at().is_some());

        let copy = store.get_job(copy_id).await.unwrap().unwrap();
        assert_eq!(copy.queue(), "billing_dlq");
        assert_eq!(copy.status(), JobStatus::DeadLettered);
        assert!(copy.completed_at().is_some());
        assert_eq!(copy.parent_job_id(), Some(1));
        assert_eq!(copy.job_type(), "charge");
        assert_eq!(copy.context()["request_id"], "r1");
        assert_eq!(copy.context()["dead_letter"]["original_job_id"], 1);
        assert_eq!(copy.context()["dead_letter"]["error"], "boom");
    }

    #[tokio::test]
    async fn dead_letter_after_attempts_shortens_the_budget() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Queue::builder("reports")
            .dead_letter_after_attempts(1)
            .build();
        let job = running_job(&store, queue, 5).await;
        let lease = job.lease().unwrap();
        let retry = RetryManager::new(store.clone());

        let outcome = retry
            .handle_failure(&job, &lease, JobError::new("boom"), Utc::now())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FailureOutcome::DeadLettered {
                dead_letter_job_id: None
            }
        );
    }

    #[tokio::test]
    async fn cancelled_job_is_not_retried() {
        let store = Arc::new(MemoryJobStore::new());
        let job = running_job(&store, Queue::builder("billing").build(), 3).await;
        let lease = job.lease().unwrap();
        store
            .transition(1, &Transition::Cancel { at: Utc::now() }, None)
            .await
            .unwrap();

        let outcome = RetryManager::new(store.clone())
            .handle_failure(&job, &lease, JobError::new("late"), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Discarded);
        assert_eq!(
            store.get_job(1).await.unwrap().unwrap().status(),
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn late_failure_from_a_replaced_worker_is_discarded() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Queue::builder("billing")
            .retry_delay_base_seconds(0)
            .retry_delay_max_seconds(0)
            .build();
        let first = running_job(&store, queue, 2).await;
        let stale = first.lease().unwrap();
        let retry = RetryManager::new(store.clone());

        // The worker is presumed dead and its attempt requeued
        let outcome = retry
            .handle_failure(&first, &stale, JobError::new("worker w missed heartbeats"), Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, FailureOutcome::Retrying { .. }));
        let second = store.claim_job(1, "w2", Utc::now()).await.unwrap().unwrap();
        assert_eq!(second.attempts(), 2);

        // Its handler finally reports, judged on its own first attempt
        let outcome = retry
            .handle_failure(&first, &stale, JobError::new("timeout"), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Discarded);

        let current = store.get_job(1).await.unwrap().unwrap();
        assert_eq!(current.status(), JobStatus::Running);
        assert_eq!(current.locked_by(), &Some("w2".to_string()));
        assert_eq!(current.attempts(), 2);

        // The current attempt is the last one and dead-letters on failure
        let outcome = retry
            .handle_failure(&second, &second.lease().unwrap(), JobError::new("boom"), Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, FailureOutcome::DeadLettered { .. }));
        assert_eq!(
            store.claim_job(1, "w3", Utc::now()).await.unwrap(),
            None
        );
    }
}
