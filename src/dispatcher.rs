use std::sync::Arc;

use chrono::{DateTime, Utc};
use hive_worker_job::{Job, JobError, Queue, Transition};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::dependency::{resolve_from_store, Resolution, DEPENDENCY_FAILED};
use crate::errors::Result;
use crate::in_flight::{InFlight, Slot};
use crate::queues::QueueRegistry;
use crate::store::{Claim, ClaimLimits, JobStore};

/// Candidates fetched per round trip to the store.
const PAGE_SIZE: usize = 32;

/// A job claimed for this worker, holding its execution slot until dropped.
pub(crate) struct DispatchedJob {
    pub(crate) job: Job,
    pub(crate) cancellation_token: CancellationToken,
    pub(crate) slot: Slot,
}

/// Selects and claims the next eligible jobs of every active queue.
pub(crate) struct Dispatcher {
    store: Arc<dyn JobStore>,
    registry: QueueRegistry,
    in_flight: Arc<InFlight>,
    worker_id: String,
    job_types: Vec<String>,
    concurrency: usize,
}

impl Dispatcher {
    pub(crate) fn new(
        store: Arc<dyn JobStore>,
        in_flight: Arc<InFlight>,
        worker_id: String,
        job_types: Vec<String>,
        concurrency: usize,
    ) -> Self {
        Self {
            registry: QueueRegistry::new(store.clone()),
            store,
            in_flight,
            worker_id,
            job_types,
            concurrency,
        }
    }

    /// Runs one dispatch pass over the active queues. Returns the jobs claimed
    /// by this worker during the pass.
    ///
    /// A failure on one queue is logged and the pass moves on to the next.
    pub(crate) async fn dispatch(&self, now: DateTime<Utc>) -> Result<Vec<DispatchedJob>> {
        let mut dispatched = Vec::new();
        if self.job_types.is_empty() || !self.in_flight.has_free_slot(self.concurrency) {
            return Ok(dispatched);
        }

        for queue in self.registry.active_queues().await? {
            if !self.in_flight.has_free_slot(self.concurrency) {
                break;
            }
            if let Err(e) = self.dispatch_queue(&queue, now, &mut dispatched).await {
                error!(queue = queue.name(), error = %e, "Could not dispatch jobs");
            }
        }

        if !dispatched.is_empty() {
            debug!(
                worker_id = self.worker_id,
                count = dispatched.len(),
                "Dispatched jobs"
            );
        }
        Ok(dispatched)
    }

    async fn dispatch_queue(
        &self,
        queue: &Queue,
        now: DateTime<Utc>,
        dispatched: &mut Vec<DispatchedJob>,
    ) -> Result<()> {
        let limits = ClaimLimits::for_queue(queue);
        // Only waiting jobs stay in the candidate set, everything else we
        // touch leaves it.
        let mut offset = 0;

        loop {
            let candidates = self
                .store
                .candidate_jobs(queue.name(), &self.job_types, now, PAGE_SIZE, offset)
                .await?;
            let page_len = candidates.len();

            for job in candidates {
                match resolve_from_store(self.store.as_ref(), &job).await? {
                    Resolution::Ready => {}
                    Resolution::Waiting(pending) => {
                        trace!(job_id = job.id(), waiting_on = ?pending, "Job waits on dependencies");
                        offset += 1;
                        continue;
                    }
                    Resolution::Failed { dependency_id } => {
                        self.fail_dependent(&job, dependency_id, now).await?;
                        continue;
                    }
                }

                let Some(mut slot) = self.in_flight.try_reserve(
                    queue.name(),
                    queue.max_jobs_per_worker() as usize,
                    self.concurrency,
                ) else {
                    return Ok(());
                };

                let claimed = match self
                    .store
                    .claim_job_within(job.id(), &self.worker_id, now, &limits)
                    .await?
                {
                    Claim::Claimed(claimed) => claimed,
                    Claim::Lost => {
                        warn!(
                            job_id = job.id(),
                            queue = queue.name(),
                            "Lost claim to another worker"
                        );
                        continue;
                    }
                    Claim::AtCapacity => {
                        trace!(queue = queue.name(), "Queue at capacity");
                        return Ok(());
                    }
                    Claim::RateLimited => {
                        debug!(queue = queue.name(), "Rate limit reached, skipping queue");
                        return Ok(());
                    }
                };

                let cancellation_token = CancellationToken::new();
                slot.attach(claimed.id(), cancellation_token.clone());
                dispatched.push(DispatchedJob {
                    job: claimed,
                    cancellation_token,
                    slot,
                });
            }

            if page_len < PAGE_SIZE {
                return Ok(());
            }
        }
    }

    /// Short-circuits a job whose dependency ended unsuccessfully.
    async fn fail_dependent(&self, job: &Job, dependency_id: i64, now: DateTime<Utc>) -> Result<()> {
        let transition = Transition::Fail {
            error: JobError::new(DEPENDENCY_FAILED)
                .with_trace(format!("dependency {dependency_id} did not complete")),
            at: now,
        };
        if self
            .store
            .transition(job.id(), &transition, None)
            .await?
            .is_some()
        {
            warn!(
                job_id = job.id(),
                queue = job.queue(),
                dependency_id,
                "Dependency failed, job failed without running"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use hive_worker_job::{JobStatus, Priority};

    use crate::store::MemoryJobStore;

    async fn setup(queue: Queue) -> Arc<MemoryJobStore> {
        let store = Arc::new(MemoryJobStore::new());
        store.create_queue(queue).await.unwrap();
        store
    }

    fn dispatcher(store: Arc<MemoryJobStore>, concurrency: usize) -> Dispatcher {
        Dispatcher::new(
            store,
            Arc::new(InFlight::default()),
            "worker_a".to_string(),
            vec!["send".to_string()],
            concurrency,
        )
    }

    fn job(id: i64, priority: Priority, created_at: DateTime<Utc>) -> Job {
        Job::builder()
            .id(id)
            .job_type("send")
            .queue("mail")
            .priority(priority)
            .created_at(created_at)
            .scheduled_at(created_at)
            .build()
    }

    #[tokio::test]
    async fn claims_by_priority_then_age() {
        let store = setup(Queue::builder("mail").build()).await;
        let t0 = Utc::now() - Duration::minutes(1);
        store.put_job(job(1, Priority::Low, t0)).await;
        store.put_job(job(2, Priority::Critical, t0 + Duration::seconds(2))).await;
        store.put_job(job(3, Priority::Critical, t0 + Duration::seconds(1))).await;

        let dispatched = dispatcher(store.clone(), 2).dispatch(Utc::now()).await.unwrap();
        let ids: Vec<i64> = dispatched.iter().map(|d| d.job.id()).collect();
        assert_eq!(ids, vec![3, 2]);
        assert!(dispatched.iter().all(|d| d.job.status() == JobStatus::Running));
        assert_eq!(
            store.get_job(1).await.unwrap().unwrap().status(),
            JobStatus::Pending
        );
    }

    #[tokio::test]
    async fn per_worker_queue_slots_are_respected() {
        let store = setup(Queue::builder("mail").max_jobs_per_worker(2).build()).await;
        let t0 = Utc::now() - Duration::minutes(1);
        for id in 1..=5 {
            store.put_job(job(id, Priority::Normal, t0)).await;
        }

        let d = dispatcher(store.clone(), 10);
        let first = d.dispatch(Utc::now()).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(d.dispatch(Utc::now()).await.unwrap().is_empty());

        drop(first);
        assert_eq!(d.dispatch(Utc::now()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn global_capacity_counts_other_workers() {
        let store = setup(
            Queue::builder("mail")
                .max_workers(1)
                .max_jobs_per_worker(2)
                .build(),
        )
        .await;
        let t0 = Utc::now() - Duration::minutes(1);
        for id in 1..=3 {
            store.put_job(job(id, Priority::Normal, t0)).await;
        }
        store.claim_job(1, "worker_b", Utc::now()).await.unwrap();

        let dispatched = dispatcher(store, 10).dispatch(Utc::now()).await.unwrap();
        assert_eq!(dispatched.len(), 1);
    }

    #[tokio::test]
    async fn waiting_dependents_are_skipped_and_failed_ones_cascade() {
        let store = setup(Queue::builder("mail").build()).await;
        let t0 = Utc::now() - Duration::minutes(1);
        store
            .put_job(
                Job::builder()
                    .id(1)
                    .job_type("other")
                    .queue("mail")
                    .scheduled_at(t0)
                    .build(),
            )
            .await;
        store
            .put_job(
                Job::builder()
                    .id(2)
                    .job_type("other")
                    .queue("mail")
                    .status(JobStatus::Failed)
                    .build(),
            )
            .await;
        let waiting = Job::builder()
            .id(3)
            .job_type("send")
            .queue("mail")
            .depends_on(vec![1])
            .scheduled_at(t0)
            .build();
        let doomed = Job::builder()
            .id(4)
            .job_type("send")
            .queue("mail")
            .depends_on(vec![1, 2])
            .scheduled_at(t0)
            .build();
        store.put_job(waiting).await;
        store.put_job(doomed).await;

        let dispatched = dispatcher(store.clone(), 4).dispatch(Utc::now()).await.unwrap();
        assert!(dispatched.is_empty());

        assert_eq!(
            store.get_job(3).await.unwrap().unwrap().status(),
            JobStatus::Pending
        );
        let doomed = store.get_job(4).await.unwrap().unwrap();
        assert_eq!(doomed.status(), JobStatus::Failed);
        assert_eq!(doomed.attempts(), 0);
        assert_eq!(doomed.last_error(), &Some(DEPENDENCY_FAILED.to_string()));
    }

    #[tokio::test]
    async fn rate_limited_queue_does_not_block_others() {
        let store = setup(Queue::builder("mail").rate_limit_per_minute(1).build()).await;
        store.create_queue(Queue::builder("sms").build()).await.unwrap();
        let t0 = Utc::now() - Duration::minutes(1);
        for id in 1..=3 {
            store.put_job(job(id, Priority::Normal, t0)).await;
        }
        for id in 4..=5 {
            store
                .put_job(
                    Job::builder()
                        .id(id)
                        .job_type("send")
                        .queue("sms")
                        .scheduled_at(t0)
                        .build(),
                )
                .await;
        }

        let dispatched = dispatcher(store, 10).dispatch(Utc::now()).await.unwrap();
        let mut queues: Vec<&str> = dispatched.iter().map(|d| d.job.queue().as_str()).collect();
        queues.sort_unstable();
        assert_eq!(queues, vec!["mail", "sms", "sms"]);
    }

    #[tokio::test]
    async fn inactive_queues_and_unknown_types_are_ignored() {
        let store = setup(Queue::builder("mail").is_active(false).build()).await;
        store.create_queue(Queue::builder("sms").build()).await.unwrap();
        let t0 = Utc::now() - Duration::minutes(1);
        store.put_job(job(1, Priority::Normal, t0)).await;
        store
            .put_job(
                Job::builder()
                    .id(2)
                    .job_type("fax")
                    .queue("sms")
                    .scheduled_at(t0)
                    .build(),
            )
            .await;

        assert!(dispatcher(store, 4).dispatch(Utc::now()).await.unwrap().is_empty());
    }
}
