use chrono::{DateTime, Utc};
use hive_worker_job::{DbJob, Job, JobStatus, Lease, NewJob, Transition};
use indoc::formatdoc;
use sqlx::{query, query_as, query_scalar, PgExecutor};

use crate::errors::Result;
use crate::store::JobFilter;

fn status_strings(statuses: &[JobStatus]) -> Vec<&'static str> {
    statuses.iter().map(|s| s.as_str()).collect()
}

fn into_jobs(rows: Vec<DbJob>) -> Result<Vec<Job>> {
    rows.into_iter()
        .map(|row| Ok(Job::from_db_job(row)?))
        .collect()
}

pub async fn insert_job(
    executor: impl for<'e> PgExecutor<'e>,
    escaped_schema: &str,
    job: NewJob,
) -> Result<Job> {
    let sql = formatdoc!(
        r#"
            insert into {escaped_schema}.jobs (
                job_type, payload, queue_name, priority, status, max_attempts,
                timeout_seconds, depends_on, parent_job_id, scheduled_at,
                context, created_by, tenant_id, completed_at
            )
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            returning *
        "#
    );

    let row: DbJob = query_as(&sql)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(&job.queue)
        .bind(job.priority.rank())
        .bind(job.status.as_str())
        .bind(job.max_attempts)
        .bind(job.timeout_seconds)
        .bind(&job.depends_on)
        .bind(job.parent_job_id)
        .bind(job.scheduled_at)
        .bind(&job.context)
        .bind(&job.created_by)
        .bind(&job.tenant_id)
        .bind(job.status.is_terminal().then(Utc::now))
        .fetch_one(executor)
        .await?;

    Ok(Job::from_db_job(row)?)
}

pub async fn get_job(
    executor: impl for<'e> PgExecutor<'e>,
    escaped_schema: &str,
    id: i64,
) -> Result<Option<Job>> {
    let sql = format!("select * from {escaped_schema}.jobs where id = $1::bigint");
    let row: Option<DbJob> = query_as(&sql).bind(id).fetch_optional(executor).await?;
    Ok(row.map(Job::from_db_job).transpose()?)
}

pub async fn get_jobs(
    executor: impl for<'e> PgExecutor<'e>,
    escaped_schema: &str,
    ids: &[i64],
) -> Result<Vec<Job>> {
    let sql = format!("select * from {escaped_schema}.jobs where id = any($1::bigint[])");
    let rows: Vec<DbJob> = query_as(&sql).bind(ids).fetch_all(executor).await?;
    into_jobs(rows)
}

pub async fn list_jobs(
    executor: impl for<'e> PgExecutor<'e>,
    escaped_schema: &str,
    filter: &JobFilter,
) -> Result<Vec<Job>> {
    let sql = formatdoc!(
        r#"
            select * from {escaped_schema}.jobs
                where ($1::text is null or queue_name = $1::text)
                and ($2::text is null or status = $2::text)
                and ($3::text is null or job_type = $3::text)
                and ($4::text is null or tenant_id = $4::text)
                order by id asc
                limit $5::bigint
                offset $6::bigint
        "#
    );

    let rows: Vec<DbJob> = query_as(&sql)
        .bind(filter.queue())
        .bind(filter.status().map(|s| s.as_str()))
        .bind(filter.job_type())
        .bind(filter.tenant_id())
        .bind(filter.limit().map(|l| l as i64))
        .bind(filter.offset().unwrap_or(0) as i64)
        .fetch_all(executor)
        .await?;
    into_jobs(rows)
}

pub async fn candidate_jobs(
    executor: impl for<'e> PgExecutor<'e>,
    escaped_schema: &str,
    queue: &str,
    job_types: &[String],
    now: DateTime<Utc>,
    limit: usize,
    offset: usize,
) -> Result<Vec<Job>> {
    let sql = formatdoc!(
        r#"
            select * from {escaped_schema}.jobs
                where queue_name = $1::text
                and status = any($2::text[])
                and scheduled_at <= $3::timestamptz
                and attempts < max_attempts
                and job_type = any($4::text[])
                order by priority desc, created_at asc, id asc
                limit $5::bigint
                offset $6::bigint
        "#
    );

    let rows: Vec<DbJob> = query_as(&sql)
        .bind(queue)
        .bind(status_strings(JobStatus::CLAIMABLE))
        .bind(now)
        .bind(job_types)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(executor)
        .await?;
    into_jobs(rows)
}

/// Locks the row of the queue holding job `id` until the end of the
/// transaction, so claims on one queue check and record its limits one at a
/// time. Returns the queue name, `None` when the job is gone.
pub async fn lock_queue_of_job(
    executor: impl PgExecutor<'_>,
    escaped_schema: &str,
    id: i64,
) -> Result<Option<String>> {
    let sql = formatdoc!(
        r#"
            select queues.name from {escaped_schema}.queues
                join {escaped_schema}.jobs on jobs.queue_name = queues.name
                where jobs.id = $1::bigint
                for update of queues
        "#
    );
    Ok(query_scalar(&sql).bind(id).fetch_optional(executor).await?)
}

/// What a queue is using of its limits at `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct QueueUsage {
    pub running: i64,
    pub last_minute: i64,
    pub last_hour: i64,
}

pub async fn queue_usage(
    executor: impl PgExecutor<'_>,
    escaped_schema: &str,
    queue: &str,
    now: DateTime<Utc>,
) -> Result<QueueUsage> {
    let sql = formatdoc!(
        r#"
            select
                (
                    select count(*) from {escaped_schema}.jobs
                        where queue_name = $1::text and status = 'running'
                ) as running,
                (
                    select count(*) from {escaped_schema}.dispatches
                        where queue_name = $1::text
                        and dispatched_at > $2::timestamptz - interval '1 minute'
                        and dispatched_at <= $2::timestamptz
                ) as last_minute,
                (
                    select count(*) from {escaped_schema}.dispatches
                        where queue_name = $1::text
                        and dispatched_at > $2::timestamptz - interval '1 hour'
                        and dispatched_at <= $2::timestamptz
                ) as last_hour
        "#
    );
    Ok(query_as(&sql)
        .bind(queue)
        .bind(now)
        .fetch_one(executor)
        .await?)
}

/// Claims the job and appends the dispatch to the queue's log in a single
/// statement. A job whose attempt budget is spent is never claimed.
#[tracing::instrument(skip_all, err, fields(otel.kind="client", db.system="postgresql", job_id = id))]
pub async fn claim_job(
    executor: impl PgExecutor<'_>,
    escaped_schema: &str,
    id: i64,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<Job>> {
    let sql = formatdoc!(
        r#"
            with claimed as (
                update {escaped_schema}.jobs
                    set
                        status = 'running',
                        attempts = attempts + 1,
                        started_at = $3::timestamptz,
                        updated_at = $3::timestamptz,
                        locked_by = $2::text
                    where id = $1::bigint
                    and status = any($4::text[])
                    and scheduled_at <= $3::timestamptz
                    and attempts < max_attempts
                    returning *
            ), dispatched as (
                insert into {escaped_schema}.dispatches (queue_name, job_id, dispatched_at)
                    select queue_name, id, $3::timestamptz from claimed
            )
            select * from claimed
        "#
    );

    let row: Option<DbJob> = query_as(&sql)
        .bind(id)
        .bind(worker_id)
        .bind(now)
        .bind(status_strings(JobStatus::CLAIMABLE))
        .fetch_optional(executor)
        .await?;
    Ok(row.map(Job::from_db_job).transpose()?)
}

pub async fn prune_dispatches(
    executor: impl for<'e> PgExecutor<'e>,
    escaped_schema: &str,
    before: DateTime<Utc>,
) -> Result<u64> {
    let sql = format!("delete from {escaped_schema}.dispatches where dispatched_at < $1::timestamptz");
    let res = query(&sql).bind(before).execute(executor).await?;
    Ok(res.rows_affected())
}

/// Column updates applied by each transition on top of `status` and
/// `updated_at`. `$4` is the transition time, `$5` and `$6` the lease; extra
/// parameters start at `$7`.
fn transition_set_clause(transition: &Transition) -> &'static str {
    match transition {
        Transition::Complete { .. } => {
            "completed_at = $4, result = $7::jsonb, locked_by = null"
        }
        Transition::Retry { .. } => {
            "scheduled_at = $7::timestamptz, last_error = $8::text, last_error_trace = $9::text, locked_by = null"
        }
        Transition::DeadLetter { .. } | Transition::Fail { .. } => {
            "completed_at = $4, last_error = $7::text, last_error_trace = $8::text, locked_by = null"
        }
        Transition::Cancel { .. } => "completed_at = $4",
        Transition::Requeue { .. } => {
            "attempts = 0, scheduled_at = $4, completed_at = null, last_error = null, last_error_trace = null, result = null, locked_by = null"
        }
    }
}

#[tracing::instrument(skip_all, err, fields(otel.kind="client", db.system="postgresql", job_id = id))]
pub async fn transition_job(
    executor: impl for<'e> PgExecutor<'e>,
    escaped_schema: &str,
    id: i64,
    transition: &Transition,
    lease: Option<&Lease>,
) -> Result<Option<Job>> {
    let set_clause = transition_set_clause(transition);
    let sql = formatdoc!(
        r#"
            update {escaped_schema}.jobs
                set
                    status = $3::text,
                    updated_at = $4::timestamptz,
                    {set_clause}
                where id = $1::bigint
                and status = any($2::text[])
                and (
                    $5::text is null
                    or (status = 'running' and locked_by = $5::text and attempts = $6::smallint)
                )
                returning *
        "#
    );

    let q = query_as::<_, DbJob>(&sql)
        .bind(id)
        .bind(status_strings(transition.from_statuses()))
        .bind(transition.target_status().as_str())
        .bind(transition.at())
        .bind(lease.map(|lease| lease.worker_id.as_str()))
        .bind(lease.map(|lease| lease.attempt));

    let q = match transition {
        Transition::Complete { result, .. } => q.bind(result.clone()),
        Transition::Retry { run_at, error, .. } => q
            .bind(*run_at)
            .bind(error.message.clone())
            .bind(error.trace.clone()),
        Transition::DeadLetter { error, .. } | Transition::Fail { error, .. } => q
            .bind(error.message.clone())
            .bind(error.trace.clone()),
        Transition::Cancel { .. } | Transition::Requeue { .. } => q,
    };

    let row = q.fetch_optional(executor).await?;
    Ok(row.map(Job::from_db_job).transpose()?)
}

pub async fn running_jobs_locked_by(
    executor: impl for<'e> PgExecutor<'e>,
    escaped_schema: &str,
    worker_id: &str,
) -> Result<Vec<Job>> {
    let sql = format!(
        "select * from {escaped_schema}.jobs where locked_by = $1::text and status = 'running'"
    );
    let rows: Vec<DbJob> = query_as(&sql).bind(worker_id).fetch_all(executor).await?;
    into_jobs(rows)
}

pub async fn delete_terminal_jobs(
    executor: impl for<'e> PgExecutor<'e>,
    escaped_schema: &str,
    queue: &str,
    statuses: &[JobStatus],
    completed_before: DateTime<Utc>,
) -> Result<u64> {
    let sql = formatdoc!(
        r#"
            delete from {escaped_schema}.jobs
                where queue_name = $1::text
                and status = any($2::text[])
                and completed_at < $3::timestamptz
        "#
    );

    let res = query(&sql)
        .bind(queue)
        .bind(status_strings(statuses))
        .bind(completed_before)
        .execute(executor)
        .await?;
    Ok(res.rows_affected())
}
