use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Value produced by a successful handler, `None` when it returned nothing.
pub type TaskOutput = Option<Value>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunTaskError {
    /// The payload could not be deserialized into the handler's type.
    /// Retrying cannot fix this, so the job fails right away.
    #[error("Payload does not match the task definition: {0}")]
    InvalidPayload(String),
    #[error("Task returned the following error: {0}")]
    TaskError(String),
    #[error("Task panicked during execution")]
    TaskPanic,
    #[error("Task exceeded its deadline of {}s", .0.as_secs())]
    TaskTimedOut(Duration),
    #[error("Task was aborted before completion")]
    TaskAborted,
}

impl RunTaskError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RunTaskError::InvalidPayload(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RunTaskError::TaskTimedOut(_))
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, RunTaskError::TaskPanic)
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, RunTaskError::TaskAborted)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpawnTaskResult {
    pub duration: Duration,
    pub result: Result<TaskOutput, RunTaskError>,
}

impl SpawnTaskResult {
    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn result(&self) -> &Result<TaskOutput, RunTaskError> {
        &self.result
    }
}
