use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Job, JobStatus};

/// Error recorded on a job after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    pub trace: Option<String>,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

/// The attempt a worker holds on a `running` job.
///
/// Outcomes are recorded against a lease: stores only apply them while the
/// job is still `running`, locked by `worker_id` on `attempt`. A worker that
/// was presumed dead cannot overwrite an attempt handed to another worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub worker_id: String,
    pub attempt: i16,
}

impl Lease {
    pub fn new(worker_id: impl Into<String>, attempt: i16) -> Self {
        Self {
            worker_id: worker_id.into(),
            attempt,
        }
    }

    pub fn holds(&self, job: &Job) -> bool {
        job.status() == JobStatus::Running
            && job.locked_by().as_deref() == Some(self.worker_id.as_str())
            && job.attempts() == self.attempt
    }
}

/// A state change applied to a job by the dispatcher, a worker or the retry
/// manager.
///
/// Every transition is conditional: stores only apply it when the job's
/// current status is one of [`Transition::from_statuses`], which makes each
/// of them a compare-and-swap on the status column. Outcomes of an attempt
/// are additionally fenced by a [`Lease`]. Claiming is handled separately
/// since it also bumps `attempts`.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Handler succeeded
    Complete {
        result: Option<Value>,
        at: DateTime<Utc>,
    },
    /// Handler failed with budget left; the job becomes eligible again at `run_at`
    Retry {
        run_at: DateTime<Utc>,
        error: JobError,
        at: DateTime<Utc>,
    },
    /// Attempt budget exhausted
    DeadLetter { error: JobError, at: DateTime<Utc> },
    /// Dependency cascade or unrecoverable error, no retry
    Fail { error: JobError, at: DateTime<Utc> },
    /// Explicit cancellation of a non-terminal job
    Cancel { at: DateTime<Utc> },
    /// Manual replay of a failed or dead-lettered job
    Requeue { at: DateTime<Utc> },
}

impl Transition {
    pub fn from_statuses(&self) -> &'static [JobStatus] {
        match self {
            Transition::Complete { .. } | Transition::Retry { .. } => &[JobStatus::Running],
            Transition::DeadLetter { .. } => &[JobStatus::Running, JobStatus::Retrying],
            Transition::Fail { .. } | Transition::Cancel { .. } => JobStatus::NON_TERMINAL,
            Transition::Requeue { .. } => &[JobStatus::Failed, JobStatus::DeadLettered],
        }
    }

    pub fn target_status(&self) -> JobStatus {
        match self {
            Transition::Complete { .. } => JobStatus::Completed,
            Transition::Retry { .. } => JobStatus::Retrying,
            Transition::DeadLetter { .. } => JobStatus::DeadLettered,
            Transition::Fail { .. } => JobStatus::Failed,
            Transition::Cancel { .. } => JobStatus::Cancelled,
            Transition::Requeue { .. } => JobStatus::Pending,
        }
    }

    pub fn allows(&self, current: JobStatus) -> bool {
        self.from_statuses().contains(&current)
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Transition::Complete { at, .. }
            | Transition::Retry { at, .. }
            | Transition::DeadLetter { at, .. }
            | Transition::Fail { at, .. }
            | Transition::Cancel { at }
            | Transition::Requeue { at } => *at,
        }
    }

    pub fn error(&self) -> Option<&JobError> {
        match self {
            Transition::Retry { error, .. }
            | Transition::DeadLetter { error, .. }
            | Transition::Fail { error, .. } => Some(error),
            _ => None,
        }
    }
}
