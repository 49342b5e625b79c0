use chrono::{DateTime, Utc};
use hive_worker_job::{DbWorker, WorkerRecord, WorkerStatus};
use indoc::formatdoc;
use sqlx::{query, query_as, PgExecutor};

use crate::errors::Result;
use crate::store::WorkerFilter;

pub async fn upsert_worker(
    executor: impl for<'e> PgExecutor<'e>,
    escaped_schema: &str,
    worker: &WorkerRecord,
) -> Result<()> {
    let sql = formatdoc!(
        r#"
            insert into {escaped_schema}.workers (
                id, status, environment, last_heartbeat, current_job_ids, started_at
            )
            values ($1, $2, $3, $4, $5, $6)
            on conflict (id) do update set
                status = excluded.status,
                environment = excluded.environment,
                last_heartbeat = excluded.last_heartbeat,
                current_job_ids = excluded.current_job_ids
        "#
    );

    query(&sql)
        .bind(worker.id())
        .bind(worker.status().as_str())
        .bind(worker.environment())
        .bind(worker.last_heartbeat())
        .bind(worker.current_job_ids())
        .bind(worker.started_at())
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn list_workers(
    executor: impl for<'e> PgExecutor<'e>,
    escaped_schema: &str,
    filter: &WorkerFilter,
) -> Result<Vec<WorkerRecord>> {
    let sql = formatdoc!(
        r#"
            select * from {escaped_schema}.workers
                where ($1::text is null or status = $1::text)
                and ($2::text is null or environment = $2::text)
                order by id asc
        "#
    );

    let rows: Vec<DbWorker> = query_as(&sql)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(&filter.environment)
        .fetch_all(executor)
        .await?;
    rows.into_iter()
        .map(|row| Ok(WorkerRecord::from_db_worker(row)?))
        .collect()
}

pub async fn mark_worker_unhealthy(
    executor: impl for<'e> PgExecutor<'e>,
    escaped_schema: &str,
    id: &str,
    stale_before: DateTime<Utc>,
) -> Result<Option<WorkerRecord>> {
    let sql = formatdoc!(
        r#"
            update {escaped_schema}.workers
                set status = $3::text
                where id = $1::text
                and status <> $3::text
                and last_heartbeat < $2::timestamptz
                returning *
        "#
    );

    let row: Option<DbWorker> = query_as(&sql)
        .bind(id)
        .bind(stale_before)
        .bind(WorkerStatus::Unhealthy.as_str())
        .fetch_optional(executor)
        .await?;
    Ok(row.map(WorkerRecord::from_db_worker).transpose()?)
}

pub async fn delete_dead_workers(
    executor: impl for<'e> PgExecutor<'e>,
    escaped_schema: &str,
    heartbeat_before: DateTime<Utc>,
) -> Result<u64> {
    let sql = format!(
        "delete from {escaped_schema}.workers where status = $1::text and last_heartbeat < $2::timestamptz"
    );
    let res = query(&sql)
        .bind(WorkerStatus::Unhealthy.as_str())
        .bind(heartbeat_before)
        .execute(executor)
        .await?;
    Ok(res.rows_affected())
}
