use chrono::{DateTime, Utc};
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::{ParseEnumError, Priority};

/// Row of the `queues` table as read by sqlx.
#[derive(FromRow, Debug, Clone, PartialEq)]
pub struct DbQueue {
    pub name: String,
    pub is_active: bool,
    pub max_workers: i32,
    pub max_jobs_per_worker: i32,
    pub rate_limit_per_minute: Option<i32>,
    pub rate_limit_per_hour: Option<i32>,
    pub default_max_attempts: i16,
    pub default_timeout_seconds: i32,
    pub retry_delay_base_seconds: i64,
    pub retry_delay_max_seconds: i64,
    pub dead_letter_queue_name: Option<String>,
    pub dead_letter_after_attempts: Option<i16>,
    pub allowed_priorities: Vec<String>,
    pub retention_completed_hours: i32,
    pub retention_failed_hours: i32,
    pub created_at: DateTime<Utc>,
}

/// A named partition of jobs with its own capacity, rate limit, retry and
/// retention policy.
///
/// ```
/// use hive_worker_job::{Priority, Queue};
///
/// let queue = Queue::builder("webhooks")
///     .max_workers(4)
///     .rate_limit_per_minute(120)
///     .dead_letter_queue_name("webhooks_dlq")
///     .allowed_priorities(vec![Priority::Normal, Priority::High])
///     .build();
///
/// assert_eq!(queue.name(), "webhooks");
/// assert_eq!(queue.capacity(), 4 * 5);
/// ```
#[derive(Getters, CopyGetters, Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[builder(build_fn(private, name = "build_internal"), pattern = "owned")]
pub struct Queue {
    #[builder(setter(into))]
    #[getset(get = "pub")]
    name: String,
    #[builder(default = "true")]
    #[getset(get_copy = "pub")]
    is_active: bool,
    /// How many workers may serve this queue at once
    #[builder(default = "10")]
    #[getset(get_copy = "pub")]
    max_workers: u32,
    /// How many of this queue's jobs a single worker may run at once
    #[builder(default = "5")]
    #[getset(get_copy = "pub")]
    max_jobs_per_worker: u32,
    #[builder(default, setter(strip_option))]
    #[getset(get_copy = "pub")]
    rate_limit_per_minute: Option<u32>,
    #[builder(default, setter(strip_option))]
    #[getset(get_copy = "pub")]
    rate_limit_per_hour: Option<u32>,
    #[builder(default = "3")]
    #[getset(get_copy = "pub")]
    default_max_attempts: i16,
    #[builder(default = "300")]
    #[getset(get_copy = "pub")]
    default_timeout_seconds: i32,
    #[builder(default = "60")]
    #[getset(get_copy = "pub")]
    retry_delay_base_seconds: i64,
    #[builder(default = "3600")]
    #[getset(get_copy = "pub")]
    retry_delay_max_seconds: i64,
    #[builder(default, setter(strip_option, into))]
    #[getset(get = "pub")]
    dead_letter_queue_name: Option<String>,
    #[builder(default, setter(strip_option))]
    #[getset(get_copy = "pub")]
    dead_letter_after_attempts: Option<i16>,
    #[builder(default = "Priority::ALL.to_vec()")]
    #[getset(get = "pub")]
    allowed_priorities: Vec<Priority>,
    #[builder(default = "24")]
    #[getset(get_copy = "pub")]
    retention_completed_hours: i32,
    #[builder(default = "168")]
    #[getset(get_copy = "pub")]
    retention_failed_hours: i32,
    #[builder(default = "Utc::now()")]
    #[getset(get_copy = "pub")]
    created_at: DateTime<Utc>,
}

impl Queue {
    pub const DEFAULT_QUEUE_NAME: &'static str = "default";

    /// Starts building a queue with every policy set to its default value.
    pub fn builder(name: impl Into<String>) -> QueueBuilder {
        QueueBuilder::default().name(name)
    }

    /// Maximum number of this queue's jobs running at once across all workers.
    pub fn capacity(&self) -> usize {
        (self.max_workers as usize).saturating_mul(self.max_jobs_per_worker as usize)
    }

    pub fn allows_priority(&self, priority: Priority) -> bool {
        self.allowed_priorities.contains(&priority)
    }

    /// Priority given to jobs enqueued without one: `normal` when allowed,
    /// otherwise the lowest allowed priority.
    pub fn default_priority(&self) -> Priority {
        if self.allows_priority(Priority::Normal) {
            return Priority::Normal;
        }
        self.allowed_priorities
            .iter()
            .min()
            .copied()
            .unwrap_or_default()
    }

    pub fn from_db_queue(row: DbQueue) -> Result<Queue, ParseEnumError> {
        let allowed_priorities = row
            .allowed_priorities
            .iter()
            .map(|p| p.parse())
            .collect::<Result<Vec<Priority>, _>>()?;

        Ok(Queue {
            name: row.name,
            is_active: row.is_active,
            max_workers: row.max_workers.max(0) as u32,
            max_jobs_per_worker: row.max_jobs_per_worker.max(0) as u32,
            rate_limit_per_minute: row.rate_limit_per_minute.map(|v| v.max(0) as u32),
            rate_limit_per_hour: row.rate_limit_per_hour.map(|v| v.max(0) as u32),
            default_max_attempts: row.default_max_attempts,
            default_timeout_seconds: row.default_timeout_seconds,
            retry_delay_base_seconds: row.retry_delay_base_seconds,
            retry_delay_max_seconds: row.retry_delay_max_seconds,
            dead_letter_queue_name: row.dead_letter_queue_name,
            dead_letter_after_attempts: row.dead_letter_after_attempts,
            allowed_priorities,
            retention_completed_hours: row.retention_completed_hours,
            retention_failed_hours: row.retention_failed_hours,
            created_at: row.created_at,
        })
    }
}

impl QueueBuilder {
    /// Builds the queue. Only the name is required and it is always set by
    /// [`Queue::builder`].
    pub fn build(self) -> Queue {
        self.build_internal()
            .expect("Queue name is set by Queue::builder, every other field has a default")
    }
}
