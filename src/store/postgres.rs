use async_trait::async_trait;
use chrono::{DateTime, Utc};
use getset::Getters;
use hive_worker_job::{Job, JobStatus, Lease, NewJob, Queue, Transition, WorkerRecord};
use hive_worker_migrations::migrate;
use sqlx::PgPool;

use super::{Claim, ClaimLimits, JobFilter, JobStore, WorkerFilter};
use crate::errors::Result;
use crate::sql::{jobs, queues, workers};
use crate::utils::escape_identifier;

/// [`JobStore`] backed by the `jobs`, `queues` and `workers` tables of a
/// PostgreSQL schema.
#[derive(Getters, Clone, Debug)]
#[getset(get = "pub")]
pub struct PgJobStore {
    pg_pool: PgPool,
    escaped_schema: String,
}

impl PgJobStore {
    /// Wraps an already escaped schema name.
    pub fn new(pg_pool: PgPool, escaped_schema: impl Into<String>) -> Self {
        Self {
            pg_pool,
            escaped_schema: escaped_schema.into(),
        }
    }

    /// Escapes `schema` and wraps the pool. Does not migrate.
    pub async fn connect(pg_pool: PgPool, schema: &str) -> Result<Self> {
        let escaped_schema = escape_identifier(&pg_pool, schema).await?;
        Ok(Self::new(pg_pool, escaped_schema))
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn migrate(&self) -> Result<()> {
        migrate(&self.pg_pool, &self.escaped_schema).await?;
        Ok(())
    }

    async fn create_queue(&self, queue: Queue) -> Result<Queue> {
        queues::create_queue(&self.pg_pool, &self.escaped_schema, queue).await
    }

    async fn get_queue(&self, name: &str) -> Result<Option<Queue>> {
        queues::get_queue(&self.pg_pool, &self.escaped_schema, name).await
    }

    async fn list_queues(&self) -> Result<Vec<Queue>> {
        queues::list_queues(&self.pg_pool, &self.escaped_schema).await
    }

    async fn insert_job(&self, job: NewJob) -> Result<Job> {
        jobs::insert_job(&self.pg_pool, &self.escaped_schema, job).await
    }

    async fn get_job(&self, id: i64) -> Result<Option<Job>> {
        jobs::get_job(&self.pg_pool, &self.escaped_schema, id).await
    }

    async fn get_jobs(&self, ids: &[i64]) -> Result<Vec<Job>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        jobs::get_jobs(&self.pg_pool, &self.escaped_schema, ids).await
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        jobs::list_jobs(&self.pg_pool, &self.escaped_schema, filter).await
    }

    async fn candidate_jobs(
        &self,
        queue: &str,
        job_types: &[String],
        now: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Job>> {
        jobs::candidate_jobs(
            &self.pg_pool,
            &self.escaped_schema,
            queue,
            job_types,
            now,
            limit,
            offset,
        )
        .await
    }

    async fn claim_job_within(
        &self,
        id: i64,
        worker_id: &str,
        now: DateTime<Utc>,
        limits: &ClaimLimits,
    ) -> Result<Claim> {
        let claimed = |job: Option<Job>| job.map_or(Claim::Lost, Claim::Claimed);
        if limits.capacity.is_none() && limits.rate_limit.is_unlimited() {
            let job = jobs::claim_job(&self.pg_pool, &self.escaped_schema, id, worker_id, now).await?;
            return Ok(claimed(job));
        }

        // The queue row lock serializes the check and the record across
        // every worker claiming on this queue.
        let mut tx = self.pg_pool.begin().await?;
        let Some(queue) = jobs::lock_queue_of_job(&mut *tx, &self.escaped_schema, id).await? else {
            return Ok(Claim::Lost);
        };
        let usage = jobs::queue_usage(&mut *tx, &self.escaped_schema, &queue, now).await?;
        if limits
            .capacity
            .is_some_and(|capacity| usage.running.max(0) as usize >= capacity)
        {
            return Ok(Claim::AtCapacity);
        }
        if !limits.rate_limit.admits(
            usage.last_minute.max(0) as usize,
            usage.last_hour.max(0) as usize,
        ) {
            return Ok(Claim::RateLimited);
        }

        let job = jobs::claim_job(&mut *tx, &self.escaped_schema, id, worker_id, now).await?;
        tx.commit().await?;
        Ok(claimed(job))
    }

    async fn transition(
        &self,
        id: i64,
        transition: &Transition,
        lease: Option<&Lease>,
    ) -> Result<Option<Job>> {
        jobs::transition_job(&self.pg_pool, &self.escaped_schema, id, transition, lease).await
    }

    async fn running_jobs_locked_by(&self, worker_id: &str) -> Result<Vec<Job>> {
        jobs::running_jobs_locked_by(&self.pg_pool, &self.escaped_schema, worker_id).await
    }

    async fn delete_terminal_jobs(
        &self,
        queue: &str,
        statuses: &[JobStatus],
        completed_before: DateTime<Utc>,
    ) -> Result<u64> {
        jobs::delete_terminal_jobs(
            &self.pg_pool,
            &self.escaped_schema,
            queue,
            statuses,
            completed_before,
        )
        .await
    }

    async fn prune_dispatches(&self, before: DateTime<Utc>) -> Result<u64> {
        jobs::prune_dispatches(&self.pg_pool, &self.escaped_schema, before).await
    }

    async fn upsert_worker(&self, worker: &WorkerRecord) -> Result<()> {
        workers::upsert_worker(&self.pg_pool, &self.escaped_schema, worker).await
    }

    async fn list_workers(&self, filter: &WorkerFilter) -> Result<Vec<WorkerRecord>> {
        workers::list_workers(&self.pg_pool, &self.escaped_schema, filter).await
    }

    async fn mark_worker_unhealthy(
        &self,
        id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<WorkerRecord>> {
        workers::mark_worker_unhealthy(&self.pg_pool, &self.escaped_schema, id, stale_before)
            .await
    }

    async fn delete_dead_workers(&self, heartbeat_before: DateTime<Utc>) -> Result<u64> {
        workers::delete_dead_workers(&self.pg_pool, &self.escaped_schema, heartbeat_before).await
    }
}
