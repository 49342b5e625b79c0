mod queue;
mod status;
mod transition;
mod worker;

use chrono::{DateTime, Utc};
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

pub use queue::{DbQueue, Queue, QueueBuilder};
pub use status::{JobStatus, ParseEnumError, Priority, WorkerStatus};
pub use transition::{JobError, Lease, Transition};
pub use worker::{
    default_unhealthy_after, DbWorker, WorkerRecord, DEFAULT_UNHEALTHY_AFTER_SECS,
};

/// `DbJob` is a row of the `jobs` table as read by sqlx.
///
/// Enumerations are stored as plain text (status) or as their numeric rank
/// (priority); use [`Job::from_db_job`] to get the typed representation.
#[derive(FromRow, Getters, Debug, Clone, PartialEq)]
#[getset(get = "pub")]
pub struct DbJob {
    id: i64,
    job_type: String,
    payload: Value,
    queue_name: String,
    priority: i16,
    status: String,
    attempts: i16,
    max_attempts: i16,
    timeout_seconds: i32,
    depends_on: Vec<i64>,
    parent_job_id: Option<i64>,
    scheduled_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    context: Value,
    created_by: String,
    tenant_id: Option<String>,
    last_error: Option<String>,
    last_error_trace: Option<String>,
    result: Option<Value>,
    locked_by: Option<String>,
}

/// A unit of deferred work with a type, an opaque payload and a lifecycle status.
#[derive(Getters, CopyGetters, Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[builder(build_fn(private, name = "build_internal"), pattern = "owned")]
pub struct Job {
    #[builder(default)]
    #[getset(get_copy = "pub")]
    id: i64,
    /// Key into the handler registry
    #[builder(default, setter(into))]
    #[getset(get = "pub")]
    job_type: String,
    /// Opaque value only the registered handler interprets
    #[builder(default = "serde_json::json!({})")]
    #[getset(get = "pub")]
    payload: Value,
    #[builder(default = "String::from(\"default\")", setter(into))]
    #[getset(get = "pub")]
    queue: String,
    #[builder(default)]
    #[getset(get_copy = "pub")]
    priority: Priority,
    #[builder(default)]
    #[getset(get_copy = "pub")]
    status: JobStatus,
    /// How many times the job has been claimed so far
    #[builder(default)]
    #[getset(get_copy = "pub")]
    attempts: i16,
    #[builder(default = "3")]
    #[getset(get_copy = "pub")]
    max_attempts: i16,
    #[builder(default = "300")]
    #[getset(get_copy = "pub")]
    timeout_seconds: i32,
    /// Jobs that must be completed before this one may run
    #[builder(default)]
    #[getset(get = "pub")]
    depends_on: Vec<i64>,
    #[builder(default, setter(strip_option))]
    #[getset(get_copy = "pub")]
    parent_job_id: Option<i64>,
    /// Earliest time at which the job may be dispatched
    #[builder(default = "Utc::now()")]
    #[getset(get_copy = "pub")]
    scheduled_at: DateTime<Utc>,
    #[builder(default = "Utc::now()")]
    #[getset(get_copy = "pub")]
    created_at: DateTime<Utc>,
    #[builder(default = "Utc::now()")]
    #[getset(get_copy = "pub")]
    updated_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    #[getset(get_copy = "pub")]
    started_at: Option<DateTime<Utc>>,
    /// Set when the job reaches any terminal status
    #[builder(default, setter(strip_option))]
    #[getset(get_copy = "pub")]
    completed_at: Option<DateTime<Utc>>,
    /// Metadata propagated to the handler alongside the payload
    #[builder(default = "serde_json::json!({})")]
    #[getset(get = "pub")]
    context: Value,
    #[builder(default, setter(into))]
    #[getset(get = "pub")]
    created_by: String,
    #[builder(default, setter(strip_option, into))]
    #[getset(get = "pub")]
    tenant_id: Option<String>,
    #[builder(default, setter(strip_option, into))]
    #[getset(get = "pub")]
    last_error: Option<String>,
    #[builder(default, setter(strip_option, into))]
    #[getset(get = "pub")]
    last_error_trace: Option<String>,
    #[builder(default, setter(strip_option))]
    #[getset(get = "pub")]
    result: Option<Value>,
    /// Worker holding the current attempt
    #[builder(default, setter(strip_option, into))]
    #[getset(get = "pub")]
    locked_by: Option<String>,
}

impl Job {
    /// Creates a new builder for constructing a `Job`.
    pub fn builder() -> JobBuilder {
        JobBuilder::default()
    }

    /// Converts a raw database row into a typed `Job`.
    pub fn from_db_job(db_job: DbJob) -> Result<Job, ParseEnumError> {
        Ok(Job {
            id: db_job.id,
            job_type: db_job.job_type,
            payload: db_job.payload,
            queue: db_job.queue_name,
            priority: Priority::from_rank(db_job.priority)?,
            status: db_job.status.parse()?,
            attempts: db_job.attempts,
            max_attempts: db_job.max_attempts,
            timeout_seconds: db_job.timeout_seconds,
            depends_on: db_job.depends_on,
            parent_job_id: db_job.parent_job_id,
            scheduled_at: db_job.scheduled_at,
            created_at: db_job.created_at,
            updated_at: db_job.updated_at,
            started_at: db_job.started_at,
            completed_at: db_job.completed_at,
            context: db_job.context,
            created_by: db_job.created_by,
            tenant_id: db_job.tenant_id,
            last_error: db_job.last_error,
            last_error_trace: db_job.last_error_trace,
            result: db_job.result,
            locked_by: db_job.locked_by,
        })
    }

    /// Whether a worker may claim this job at `now`. A job whose attempt
    /// budget is spent is never claimed again.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.scheduled_at <= now && self.attempts < self.max_attempts
    }

    /// The attempt currently held on this job, if it is `running`.
    pub fn lease(&self) -> Option<Lease> {
        match (&self.status, &self.locked_by) {
            (JobStatus::Running, Some(worker_id)) => Some(Lease::new(worker_id, self.attempts)),
            _ => None,
        }
    }

    /// Whether another failure would exhaust the attempt budget.
    pub fn attempts_exhausted(&self, dead_letter_after_attempts: Option<i16>) -> bool {
        let budget = match dead_letter_after_attempts {
            Some(after) => after.min(self.max_attempts),
            None => self.max_attempts,
        };
        self.attempts >= budget
    }

    /// Applies a successful claim. Callers must have checked
    /// [`Job::is_claimable_at`] under the same lock.
    pub fn apply_claim(&mut self, worker_id: &str, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.attempts += 1;
        self.started_at = Some(now);
        self.locked_by = Some(worker_id.to_string());
        self.updated_at = now;
    }

    /// Applies a state transition. Callers must have checked
    /// [`Transition::allows`] for the current status under the same lock.
    pub fn apply(&mut self, transition: &Transition) {
        self.status = transition.target_status();
        self.updated_at = transition.at();
        match transition {
            Transition::Complete { result, at } => {
                self.completed_at = Some(*at);
                self.result = result.clone();
                self.locked_by = None;
            }
            Transition::Retry { run_at, error, .. } => {
                self.scheduled_at = *run_at;
                self.last_error = Some(error.message.clone());
                self.last_error_trace = error.trace.clone();
                self.locked_by = None;
            }
            Transition::DeadLetter { error, at } | Transition::Fail { error, at } => {
                self.completed_at = Some(*at);
                self.last_error = Some(error.message.clone());
                self.last_error_trace = error.trace.clone();
                self.locked_by = None;
            }
            Transition::Cancel { at } => {
                self.completed_at = Some(*at);
            }
            Transition::Requeue { at } => {
                self.attempts = 0;
                self.scheduled_at = *at;
                self.completed_at = None;
                self.last_error = None;
                self.last_error_trace = None;
                self.result = None;
                self.locked_by = None;
            }
        }
    }
}

impl JobBuilder {
    /// Builds the Job with all configured values.
    pub fn build(self) -> Job {
        self.build_internal()
            .expect("All fields have defaults, build should never fail")
    }
}

/// Fully resolved values of a job about to be inserted.
///
/// Defaults coming from the queue have already been applied; the store only
/// assigns the id and timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_type: String,
    pub payload: Value,
    pub queue: String,
    pub priority: Priority,
    pub status: JobStatus,
    pub max_attempts: i16,
    pub timeout_seconds: i32,
    pub depends_on: Vec<i64>,
    pub parent_job_id: Option<i64>,
    pub scheduled_at: DateTime<Utc>,
    pub context: Value,
    pub created_by: String,
    pub tenant_id: Option<String>,
}

impl NewJob {
    pub fn into_job(self, id: i64, now: DateTime<Utc>) -> Job {
        Job {
            id,
            job_type: self.job_type,
            payload: self.payload,
            queue: self.queue,
            priority: self.priority,
            status: self.status,
            attempts: 0,
            max_attempts: self.max_attempts,
            timeout_seconds: self.timeout_seconds,
            depends_on: self.depends_on,
            parent_job_id: self.parent_job_id,
            scheduled_at: self.scheduled_at,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: self.status.is_terminal().then_some(now),
            context: self.context,
            created_by: self.created_by,
            tenant_id: self.tenant_id,
            last_error: None,
            last_error_trace: None,
            result: None,
            locked_by: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn db_job() -> DbJob {
        DbJob {
            id: 1,
            job_type: "send_invoice".to_string(),
            payload: serde_json::json!({ "invoice": 42 }),
            queue_name: "billing".to_string(),
            priority: 2,
            status: "retrying".to_string(),
            attempts: 1,
            max_attempts: 5,
            timeout_seconds: 30,
            depends_on: vec![7, 8],
            parent_job_id: Some(3),
            scheduled_at: Utc::now(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            started_at: None,
            completed_at: None,
            context: serde_json::json!({ "request_id": "abc" }),
            created_by: "user:1".to_string(),
            tenant_id: Some("org_1".to_string()),
            last_error: Some("boom".to_string()),
            last_error_trace: None,
            result: None,
            locked_by: None,
        }
    }

    #[test]
    fn test_from_db_job() {
        let job = Job::from_db_job(db_job()).unwrap();
        assert_eq!(job.id(), 1);
        assert_eq!(job.job_type(), "send_invoice");
        assert_eq!(job.queue(), "billing");
        assert_eq!(job.priority(), Priority::High);
        assert_eq!(job.status(), JobStatus::Retrying);
        assert_eq!(job.depends_on(), &vec![7, 8]);
        assert_eq!(job.parent_job_id(), Some(3));
        assert_eq!(job.tenant_id(), &Some("org_1".to_string()));
        assert_eq!(job.last_error(), &Some("boom".to_string()));
    }

    #[test]
    fn test_from_db_job_rejects_unknown_status() {
        let mut row = db_job();
        row.status = "exploded".to_string();
        assert!(Job::from_db_job(row).is_err());
    }

    #[test]
    fn claim_increments_attempts_and_locks() {
        let now = Utc::now();
        let mut job = Job::builder().max_attempts(2).scheduled_at(now).build();
        assert!(job.is_claimable_at(now));

        job.apply_claim("w1", now);
        assert_eq!(job.status(), JobStatus::Running);
        assert_eq!(job.attempts(), 1);
        assert_eq!(job.started_at(), Some(now));
        assert_eq!(job.locked_by(), &Some("w1".to_string()));
        assert_eq!(job.lease(), Some(Lease::new("w1", 1)));
        assert!(!job.is_claimable_at(now));
    }

    #[test]
    fn spent_budget_is_not_claimable() {
        let now = Utc::now();
        let job = Job::builder()
            .status(JobStatus::Retrying)
            .attempts(3)
            .max_attempts(3)
            .scheduled_at(now)
            .build();
        assert!(!job.is_claimable_at(now));
        assert_eq!(job.lease(), None);
    }

    #[test]
    fn lease_is_tied_to_worker_and_attempt() {
        let now = Utc::now();
        let mut job = Job::builder().max_attempts(3).scheduled_at(now).build();
        job.apply_claim("w1", now);
        let first = job.lease().unwrap();
        assert!(first.holds(&job));

        job.apply(&Transition::Retry {
            run_at: now,
            error: JobError::new("worker w1 missed heartbeats"),
            at: now,
        });
        assert!(!first.holds(&job));

        job.apply_claim("w2", now);
        assert!(!first.holds(&job));
        assert!(job.lease().unwrap().holds(&job));
        assert_eq!(job.attempts(), 2);
    }

    #[test]
    fn terminal_new_job_is_completed_on_insert() {
        let now = Utc::now();
        let new_job = |status| NewJob {
            job_type: "charge".into(),
            payload: serde_json::json!({}),
            queue: "billing_dlq".into(),
            priority: Priority::Normal,
            status,
            max_attempts: 3,
            timeout_seconds: 30,
            depends_on: Vec::new(),
            parent_job_id: Some(1),
            scheduled_at: now,
            context: serde_json::json!({}),
            created_by: String::new(),
            tenant_id: None,
        };
        let copy = new_job(JobStatus::DeadLettered).into_job(2, now);
        assert_eq!(copy.completed_at(), Some(now));
        assert!(!copy.is_claimable_at(now));
        assert_eq!(new_job(JobStatus::Pending).into_job(3, now).completed_at(), None);
    }

    #[test]
    fn future_job_is_not_claimable() {
        let now = Utc::now();
        let job = Job::builder()
            .status(JobStatus::Scheduled)
            .scheduled_at(now + Duration::minutes(5))
            .build();
        assert!(!job.is_claimable_at(now));
        assert!(job.is_claimable_at(now + Duration::minutes(5)));
    }

    #[test]
    fn attempts_budget_uses_dead_letter_threshold() {
        let job = Job::builder().attempts(2).max_attempts(5).build();
        assert!(!job.attempts_exhausted(None));
        assert!(job.attempts_exhausted(Some(2)));
        assert!(!job.attempts_exhausted(Some(9)));
    }

    #[test]
    fn requeue_resets_attempts_and_error() {
        let now = Utc::now();
        let mut job = Job::builder()
            .status(JobStatus::DeadLettered)
            .attempts(3)
            .last_error("boom")
            .build();
        let requeue = Transition::Requeue { at: now };
        assert!(requeue.allows(job.status()));
        job.apply(&requeue);
        assert_eq!(job.status(), JobStatus::Pending);
        assert_eq!(job.attempts(), 0);
        assert_eq!(job.last_error(), &None);
        assert_eq!(job.scheduled_at(), now);
        assert_eq!(job.completed_at(), None);
    }
}
