use hive_worker_job::{DbQueue, Queue};
use indoc::formatdoc;
use sqlx::{query_as, PgExecutor};

use crate::errors::{Result, ValidationError};

/// Narrows a count to its `int` column, refusing values that would wrap.
fn int_column(queue: &Queue, value: u32) -> std::result::Result<i32, ValidationError> {
    i32::try_from(value).map_err(|_| ValidationError::InvalidQueueConfig {
        queue: queue.name().clone(),
        reason: format!("{value} does not fit an integer column"),
    })
}

pub async fn create_queue(
    executor: impl for<'e> PgExecutor<'e>,
    escaped_schema: &str,
    queue: Queue,
) -> Result<Queue> {
    let sql = formatdoc!(
        r#"
            insert into {escaped_schema}.queues (
                name, is_active, max_workers, max_jobs_per_worker,
                rate_limit_per_minute, rate_limit_per_hour,
                default_max_attempts, default_timeout_seconds,
                retry_delay_base_seconds, retry_delay_max_seconds,
                dead_letter_queue_name, dead_letter_after_attempts,
                allowed_priorities, retention_completed_hours,
                retention_failed_hours, created_at
            )
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            returning *
        "#
    );

    let allowed_priorities: Vec<&str> = queue
        .allowed_priorities()
        .iter()
        .map(|p| p.as_str())
        .collect();

    let max_workers = int_column(&queue, queue.max_workers())?;
    let max_jobs_per_worker = int_column(&queue, queue.max_jobs_per_worker())?;
    let rate_limit_per_minute = queue
        .rate_limit_per_minute()
        .map(|v| int_column(&queue, v))
        .transpose()?;
    let rate_limit_per_hour = queue
        .rate_limit_per_hour()
        .map(|v| int_column(&queue, v))
        .transpose()?;

    let res = query_as::<_, DbQueue>(&sql)
        .bind(queue.name())
        .bind(queue.is_active())
        .bind(max_workers)
        .bind(max_jobs_per_worker)
        .bind(rate_limit_per_minute)
        .bind(rate_limit_per_hour)
        .bind(queue.default_max_attempts())
        .bind(queue.default_timeout_seconds())
        .bind(queue.retry_delay_base_seconds())
        .bind(queue.retry_delay_max_seconds())
        .bind(queue.dead_letter_queue_name())
        .bind(queue.dead_letter_after_attempts())
        .bind(allowed_priorities)
        .bind(queue.retention_completed_hours())
        .bind(queue.retention_failed_hours())
        .bind(queue.created_at())
        .fetch_one(executor)
        .await;

    match res {
        Ok(row) => Ok(Queue::from_db_queue(row)?),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            Err(ValidationError::DuplicateQueue(queue.name().clone()).into())
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn get_queue(
    executor: impl for<'e> PgExecutor<'e>,
    escaped_schema: &str,
    name: &str,
) -> Result<Option<Queue>> {
    let sql = format!("select * from {escaped_schema}.queues where name = $1::text");
    let row: Option<DbQueue> = query_as(&sql).bind(name).fetch_optional(executor).await?;
    Ok(row.map(Queue::from_db_queue).transpose()?)
}

pub async fn list_queues(
    executor: impl for<'e> PgExecutor<'e>,
    escaped_schema: &str,
) -> Result<Vec<Queue>> {
    let sql = format!("select * from {escaped_schema}.queues order by name asc");
    let rows: Vec<DbQueue> = query_as(&sql).fetch_all(executor).await?;
    rows.into_iter()
        .map(|row| Ok(Queue::from_db_queue(row)?))
        .collect()
}
