use chrono::{DateTime, Duration, Utc};
use getset::Getters;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::{ParseEnumError, WorkerStatus};

/// A worker whose last heartbeat is older than this many seconds is
/// considered unhealthy.
pub const DEFAULT_UNHEALTHY_AFTER_SECS: i64 = 120;

pub fn default_unhealthy_after() -> Duration {
    Duration::seconds(DEFAULT_UNHEALTHY_AFTER_SECS)
}

/// Row of the `workers` table as read by sqlx.
#[derive(FromRow, Debug, Clone, PartialEq)]
pub struct DbWorker {
    pub id: String,
    pub status: String,
    pub environment: String,
    pub last_heartbeat: DateTime<Utc>,
    pub current_job_ids: Vec<i64>,
    pub started_at: DateTime<Utc>,
}

/// Persisted state of a worker process, as seen by the health monitor and
/// by `list_workers`.
#[derive(Getters, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[getset(get = "pub")]
pub struct WorkerRecord {
    id: String,
    status: WorkerStatus,
    /// Deployment tag (e.g. `production`, `staging`)
    environment: String,
    last_heartbeat: DateTime<Utc>,
    /// Jobs this worker reported as in flight in its last heartbeat
    current_job_ids: Vec<i64>,
    started_at: DateTime<Utc>,
}

impl WorkerRecord {
    pub fn new(id: impl Into<String>, environment: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            status: WorkerStatus::Idle,
            environment: environment.into(),
            last_heartbeat: now,
            current_job_ids: Vec::new(),
            started_at: now,
        }
    }

    pub fn from_db_worker(row: DbWorker) -> Result<Self, ParseEnumError> {
        Ok(Self {
            id: row.id,
            status: row.status.parse()?,
            environment: row.environment,
            last_heartbeat: row.last_heartbeat,
            current_job_ids: row.current_job_ids,
            started_at: row.started_at,
        })
    }

    /// Healthy means the worker has not been flagged and its heartbeat is
    /// fresher than `threshold`.
    pub fn is_healthy(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.status != WorkerStatus::Unhealthy && !self.is_stale(now, threshold)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now - self.last_heartbeat > threshold
    }

    pub fn record_heartbeat(
        &mut self,
        status: WorkerStatus,
        current_job_ids: Vec<i64>,
        now: DateTime<Utc>,
    ) {
        self.status = status;
        self.current_job_ids = current_job_ids;
        self.last_heartbeat = now;
    }

    pub fn set_status(&mut self, status: WorkerStatus) {
        self.status = status;
    }

    /// Same record with its heartbeat moved, used to simulate stale workers.
    pub fn with_last_heartbeat(mut self, last_heartbeat: DateTime<Utc>) -> Self {
        self.last_heartbeat = last_heartbeat;
        self
    }
}
