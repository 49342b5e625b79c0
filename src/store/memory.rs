use std::cmp::Reverse;
use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hive_worker_job::{
    Job, JobStatus, Lease, NewJob, Queue, Transition, WorkerRecord, WorkerStatus,
};
use tokio::sync::Mutex;

use super::{Claim, ClaimLimits, JobFilter, JobStore, WorkerFilter};
use crate::errors::{Result, ValidationError};
use crate::rate_limiter::RateLimiter;

#[derive(Default)]
struct MemoryState {
    next_job_id: i64,
    queues: BTreeMap<String, Queue>,
    jobs: BTreeMap<i64, Job>,
    workers: BTreeMap<String, WorkerRecord>,
    dispatches: RateLimiter,
}

/// In-process [`JobStore`]. Every operation runs under a single lock, which
/// makes claims, their queue limits and transitions trivially atomic for
/// every worker sharing the store.
#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `job` as is, keeping its id. Meant for seeding fixtures that
    /// bypass enqueue validation.
    pub async fn put_job(&self, job: Job) {
        let mut state = self.state.lock().await;
        state.next_job_id = state.next_job_id.max(job.id());
        state.jobs.insert(job.id(), job);
    }

    /// Stores `worker` as is. Meant for seeding fixtures.
    pub async fn put_worker(&self, worker: WorkerRecord) {
        let mut state = self.state.lock().await;
        state.workers.insert(worker.id().clone(), worker);
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_queue(&self, queue: Queue) -> Result<Queue> {
        let mut state = self.state.lock().await;
        if state.queues.contains_key(queue.name()) {
            return Err(ValidationError::DuplicateQueue(queue.name().clone()).into());
        }
        state.queues.insert(queue.name().clone(), queue.clone());
        Ok(queue)
    }

    async fn get_queue(&self, name: &str) -> Result<Option<Queue>> {
        Ok(self.state.lock().await.queues.get(name).cloned())
    }

    async fn list_queues(&self) -> Result<Vec<Queue>> {
        Ok(self.state.lock().await.queues.values().cloned().collect())
    }

    async fn insert_job(&self, job: NewJob) -> Result<Job> {
        let mut state = self.state.lock().await;
        state.next_job_id += 1;
        let job = job.into_job(state.next_job_id, Utc::now());
        state.jobs.insert(job.id(), job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: i64) -> Result<Option<Job>> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn get_jobs(&self, ids: &[i64]) -> Result<Vec<Job>> {
        let state = self.state.lock().await;
        Ok(ids.iter().filter_map(|id| state.jobs.get(id).cloned()).collect())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .skip(filter.offset().unwrap_or(0))
            .take(filter.limit().unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn candidate_jobs(
        &self,
        queue: &str,
        job_types: &[String],
        now: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Job>> {
        let state = self.state.lock().await;
        let mut candidates: Vec<&Job> = state
            .jobs
            .values()
            .filter(|job| {
                job.queue() == queue
                    && job.is_claimable_at(now)
                    && job_types.iter().any(|t| t == job.job_type())
            })
            .collect();
        candidates.sort_by_key(|job| (Reverse(job.priority()), job.created_at(), job.id()));
        Ok(candidates
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn claim_job_within(
        &self,
        id: i64,
        worker_id: &str,
        now: DateTime<Utc>,
        limits: &ClaimLimits,
    ) -> Result<Claim> {
        let mut state = self.state.lock().await;
        let MemoryState {
            jobs, dispatches, ..
        } = &mut *state;

        let Some(queue) = jobs
            .get(&id)
            .filter(|job| job.is_claimable_at(now))
            .map(|job| job.queue().clone())
        else {
            return Ok(Claim::Lost);
        };

        if let Some(capacity) = limits.capacity {
            let running = jobs
                .values()
                .filter(|job| *job.queue() == queue && job.status() == JobStatus::Running)
                .count();
            if running >= capacity {
                return Ok(Claim::AtCapacity);
            }
        }
        if !dispatches.try_acquire(&queue, &limits.rate_limit, now) {
            return Ok(Claim::RateLimited);
        }

        let Some(job) = jobs.get_mut(&id) else {
            return Ok(Claim::Lost);
        };
        job.apply_claim(worker_id, now);
        Ok(Claim::Claimed(job.clone()))
    }

    async fn transition(
        &self,
        id: i64,
        transition: &Transition,
        lease: Option<&Lease>,
    ) -> Result<Option<Job>> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if !transition.allows(job.status()) || lease.is_some_and(|lease| !lease.holds(job)) {
            return Ok(None);
        }
        job.apply(transition);
        Ok(Some(job.clone()))
    }

    async fn running_jobs_locked_by(&self, worker_id: &str) -> Result<Vec<Job>> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| {
                job.status() == JobStatus::Running && job.locked_by().as_deref() == Some(worker_id)
            })
            .cloned()
            .collect())
    }

    async fn delete_terminal_jobs(
        &self,
        queue: &str,
        statuses: &[JobStatus],
        completed_before: DateTime<Utc>,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.jobs.len();
        state.jobs.retain(|_, job| {
            let expired = job.queue() == queue
                && statuses.contains(&job.status())
                && job.completed_at().is_some_and(|at| at < completed_before);
            !expired
        });
        Ok((before - state.jobs.len()) as u64)
    }

    async fn prune_dispatches(&self, before: DateTime<Utc>) -> Result<u64> {
        Ok(self.state.lock().await.dispatches.prune(before))
    }

    async fn upsert_worker(&self, worker: &WorkerRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        state.workers.insert(worker.id().clone(), worker.clone());
        Ok(())
    }

    async fn list_workers(&self, filter: &WorkerFilter) -> Result<Vec<WorkerRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .workers
            .values()
            .filter(|worker| filter.matches(worker))
            .cloned()
            .collect())
    }

    async fn mark_worker_unhealthy(
        &self,
        id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<WorkerRecord>> {
        let mut state = self.state.lock().await;
        let Some(worker) = state.workers.get_mut(id) else {
            return Ok(None);
        };
        if *worker.status() == WorkerStatus::Unhealthy || *worker.last_heartbeat() >= stale_before
        {
            return Ok(None);
        }
        worker.set_status(WorkerStatus::Unhealthy);
        Ok(Some(worker.clone()))
    }

    async fn delete_dead_workers(&self, heartbeat_before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.workers.len();
        state.workers.retain(|_, worker| {
            *worker.status() != WorkerStatus::Unhealthy
                || *worker.last_heartbeat() >= heartbeat_before
        });
        Ok((before - state.workers.len()) as u64)
    }
}
