use hive_worker_job::{ParseEnumError, Priority};
use hive_worker_migrations::MigrateError;
use thiserror::Error;

/// Reasons a job or queue is rejected before anything is persisted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("job_type must not be empty")]
    EmptyJobType,
    #[error("queue '{0}' does not exist")]
    UnknownQueue(String),
    #[error("queue '{0}' is not active")]
    InactiveQueue(String),
    #[error("priority '{priority}' is not allowed on queue '{queue}'")]
    DisallowedPriority { queue: String, priority: Priority },
    #[error("dependency {0} does not exist")]
    UnknownDependency(i64),
    #[error("job {0} cannot depend on itself")]
    SelfDependency(i64),
    #[error("dependencies form a cycle through job {0}")]
    DependencyCycle(i64),
    #[error("queue '{0}' already exists")]
    DuplicateQueue(String),
    #[error("invalid configuration for queue '{queue}': {reason}")]
    InvalidQueueConfig { queue: String, reason: String },
    #[error("invalid job options: {0}")]
    InvalidJobSpec(String),
}

/// Errors that can occur during hive_worker operations.
#[derive(Error, Debug)]
pub enum HiveWorkerError {
    /// An error occurred while executing an SQL query
    #[error("Error occured while query: {0}")]
    SqlError(#[from] sqlx::Error),

    #[error("Error while serializing params: {0}")]
    JsonSerializeError(#[from] serde_json::Error),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Job {0} not found")]
    JobNotFound(i64),

    #[error("Queue '{0}' not found")]
    QueueNotFound(String),

    #[error("Error while migrating: {0}")]
    Migration(#[from] MigrateError),

    /// A stored row could not be mapped back to the data model
    #[error("Corrupted store data: {0}")]
    Store(String),
}

impl From<ParseEnumError> for HiveWorkerError {
    fn from(e: ParseEnumError) -> Self {
        HiveWorkerError::Store(e.to_string())
    }
}

impl HiveWorkerError {
    pub fn is_validation(&self) -> bool {
        matches!(self, HiveWorkerError::Validation(_))
    }
}

/// A Result type alias for HiveWorkerError.
pub type Result<T> = core::result::Result<T, HiveWorkerError>;
