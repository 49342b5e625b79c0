//! Persistence of jobs, queues and worker records.
//!
//! Every job state change goes through [`JobStore::claim_job_within`] or
//! [`JobStore::transition`]. Both are conditional on the job's current status
//! and report when another actor changed it first.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use hive_worker_job::{
    Job, JobStatus, Lease, NewJob, Queue, Transition, WorkerRecord, WorkerStatus,
};

use crate::errors::Result;
use crate::rate_limiter::RateLimit;

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

/// Filters for [`JobStore::list_jobs`]. Results are ordered by id.
#[derive(Getters, CopyGetters, Debug, Clone, Default, PartialEq, Eq, Builder)]
#[builder(
    build_fn(private, name = "build_internal"),
    setter(strip_option),
    default,
    pattern = "owned"
)]
pub struct JobFilter {
    #[builder(setter(into))]
    #[getset(get = "pub")]
    queue: Option<String>,
    #[getset(get_copy = "pub")]
    status: Option<JobStatus>,
    #[builder(setter(into))]
    #[getset(get = "pub")]
    job_type: Option<String>,
    #[builder(setter(into))]
    #[getset(get = "pub")]
    tenant_id: Option<String>,
    #[getset(get_copy = "pub")]
    limit: Option<usize>,
    #[getset(get_copy = "pub")]
    offset: Option<usize>,
}

impl JobFilter {
    pub fn builder() -> JobFilterBuilder {
        JobFilterBuilder::default()
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.queue.as_deref().is_none_or(|q| job.queue() == q)
            && self.status.is_none_or(|s| job.status() == s)
            && self.job_type.as_deref().is_none_or(|t| job.job_type() == t)
            && self
                .tenant_id
                .as_deref()
                .is_none_or(|t| job.tenant_id().as_deref() == Some(t))
    }
}

impl JobFilterBuilder {
    pub fn build(self) -> JobFilter {
        self.build_internal()
            .expect("There is a default value for all fields")
    }
}

/// Queue-wide limits a claim must respect. They are checked against every
/// worker's claims, and the dispatch is recorded in the same atomic step as
/// the claim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClaimLimits {
    /// Maximum `running` jobs of the queue across all workers
    pub capacity: Option<usize>,
    pub rate_limit: RateLimit,
}

impl ClaimLimits {
    pub fn for_queue(queue: &Queue) -> Self {
        Self {
            capacity: Some(queue.capacity()),
            rate_limit: RateLimit::of(queue),
        }
    }
}

/// Outcome of [`JobStore::claim_job_within`].
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// The job is now `running` for the caller
    Claimed(Job),
    /// The job is gone or no longer claimable
    Lost,
    /// The queue already runs `capacity` jobs
    AtCapacity,
    /// A rate-limit window of the queue is exhausted
    RateLimited,
}

/// Filters for [`JobStore::list_workers`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerFilter {
    pub status: Option<WorkerStatus>,
    pub environment: Option<String>,
}

impl WorkerFilter {
    pub fn matches(&self, worker: &WorkerRecord) -> bool {
        self.status.is_none_or(|s| *worker.status() == s)
            && self
                .environment
                .as_deref()
                .is_none_or(|e| worker.environment() == e)
    }
}

#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Installs or upgrades the persistent schema. Stores without one have
    /// nothing to do.
    async fn migrate(&self) -> Result<()> {
        Ok(())
    }

    /// Persists a queue. Fails with `DuplicateQueue` when the name is taken.
    async fn create_queue(&self, queue: Queue) -> Result<Queue>;

    async fn get_queue(&self, name: &str) -> Result<Option<Queue>>;

    /// All queues ordered by name.
    async fn list_queues(&self) -> Result<Vec<Queue>>;

    /// Persists an already validated job and assigns its id.
    async fn insert_job(&self, job: NewJob) -> Result<Job>;

    async fn get_job(&self, id: i64) -> Result<Option<Job>>;

    /// The subset of `ids` that exist, in no particular order.
    async fn get_jobs(&self, ids: &[i64]) -> Result<Vec<Job>>;

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// Claimable jobs of `queue` due at `now` whose type is one of
    /// `job_types`, ordered by priority descending then `created_at`
    /// ascending.
    async fn candidate_jobs(
        &self,
        queue: &str,
        job_types: &[String],
        now: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Job>>;

    /// Moves a claimable job to `running` for `worker_id` when its queue is
    /// under `limits`, and records the dispatch in the queue's rate-limit
    /// windows. Exactly one of several concurrent callers gets
    /// [`Claim::Claimed`], and concurrent claims on one queue never exceed
    /// its limits together.
    async fn claim_job_within(
        &self,
        id: i64,
        worker_id: &str,
        now: DateTime<Utc>,
        limits: &ClaimLimits,
    ) -> Result<Claim>;

    /// Claims a job regardless of queue limits.
    async fn claim_job(
        &self,
        id: i64,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let claim = self
            .claim_job_within(id, worker_id, now, &ClaimLimits::default())
            .await?;
        Ok(match claim {
            Claim::Claimed(job) => Some(job),
            _ => None,
        })
    }

    /// Applies `transition` if the job's status is one of
    /// [`Transition::from_statuses`] and, when a `lease` is given, the job is
    /// still held under it.
    async fn transition(
        &self,
        id: i64,
        transition: &Transition,
        lease: Option<&Lease>,
    ) -> Result<Option<Job>>;

    /// `running` jobs whose current attempt is held by `worker_id`.
    async fn running_jobs_locked_by(&self, worker_id: &str) -> Result<Vec<Job>>;

    /// Deletes jobs of `queue` in one of `statuses` completed before
    /// `completed_before`. Returns the number of deleted jobs.
    async fn delete_terminal_jobs(
        &self,
        queue: &str,
        statuses: &[JobStatus],
        completed_before: DateTime<Utc>,
    ) -> Result<u64>;

    /// Forgets recorded dispatches older than `before`. They no longer count
    /// towards any rate-limit window once older than an hour.
    async fn prune_dispatches(&self, before: DateTime<Utc>) -> Result<u64>;

    /// Inserts or replaces a worker record. Used for registration and
    /// heartbeats.
    async fn upsert_worker(&self, worker: &WorkerRecord) -> Result<()>;

    async fn list_workers(&self, filter: &WorkerFilter) -> Result<Vec<WorkerRecord>>;

    /// Marks the worker `unhealthy` if its last heartbeat is older than
    /// `stale_before` and it is not unhealthy already. Only one concurrent
    /// caller gets `Some`.
    async fn mark_worker_unhealthy(
        &self,
        id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<WorkerRecord>>;

    /// Deletes `unhealthy` workers whose last heartbeat is older than
    /// `heartbeat_before`.
    async fn delete_dead_workers(&self, heartbeat_before: DateTime<Utc>) -> Result<u64>;
}
