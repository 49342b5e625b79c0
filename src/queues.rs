use std::sync::Arc;

use hive_worker_job::{Priority, Queue};
use tracing::info;

use crate::errors::{HiveWorkerError, Result, ValidationError};
use crate::store::JobStore;

/// Validated access to queue definitions.
#[derive(Clone)]
pub struct QueueRegistry {
    store: Arc<dyn JobStore>,
}

fn invalid(queue: &Queue, reason: &str) -> ValidationError {
    ValidationError::InvalidQueueConfig {
        queue: queue.name().clone(),
        reason: reason.to_string(),
    }
}

/// Checks the internal consistency of a queue definition.
pub fn validate_queue(queue: &Queue) -> std::result::Result<(), ValidationError> {
    if queue.name().trim().is_empty() {
        return Err(invalid(queue, "name must not be empty"));
    }
    if queue.max_workers() == 0 || queue.max_jobs_per_worker() == 0 {
        return Err(invalid(
            queue,
            "max_workers and max_jobs_per_worker must be positive",
        ));
    }
    if queue.rate_limit_per_minute() == Some(0) || queue.rate_limit_per_hour() == Some(0) {
        return Err(invalid(queue, "rate limits must be positive when set"));
    }
    let counts = [
        Some(queue.max_workers()),
        Some(queue.max_jobs_per_worker()),
        queue.rate_limit_per_minute(),
        queue.rate_limit_per_hour(),
    ];
    if counts.into_iter().flatten().any(|v| i32::try_from(v).is_err()) {
        return Err(invalid(
            queue,
            "worker counts and rate limits must not exceed 2147483647",
        ));
    }
    if queue.default_max_attempts() <= 0 {
        return Err(invalid(queue, "default_max_attempts must be positive"));
    }
    if queue.default_timeout_seconds() <= 0 {
        return Err(invalid(queue, "default_timeout_seconds must be positive"));
    }
    if queue.retry_delay_base_seconds() < 0
        || queue.retry_delay_max_seconds() < queue.retry_delay_base_seconds()
    {
        return Err(invalid(
            queue,
            "retry delays must satisfy 0 <= base <= max",
        ));
    }
    if queue.dead_letter_after_attempts().is_some_and(|a| a <= 0) {
        return Err(invalid(queue, "dead_letter_after_attempts must be positive"));
    }
    if queue.dead_letter_queue_name().as_deref() == Some(queue.name().as_str()) {
        return Err(invalid(queue, "a queue cannot dead-letter into itself"));
    }
    if queue.allowed_priorities().is_empty() {
        return Err(invalid(queue, "allowed_priorities must not be empty"));
    }
    if queue.retention_completed_hours() < 0 || queue.retention_failed_hours() < 0 {
        return Err(invalid(queue, "retention windows must not be negative"));
    }
    Ok(())
}

impl QueueRegistry {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn create_queue(&self, queue: Queue) -> Result<Queue> {
        validate_queue(&queue)?;
        let queue = self.store.create_queue(queue).await?;
        info!(queue = queue.name(), "Queue created");
        Ok(queue)
    }

    pub async fn get_queue(&self, name: &str) -> Result<Queue> {
        self.store
            .get_queue(name)
            .await?
            .ok_or_else(|| HiveWorkerError::QueueNotFound(name.to_string()))
    }

    pub async fn list_queues(&self) -> Result<Vec<Queue>> {
        self.store.list_queues().await
    }

    pub async fn active_queues(&self) -> Result<Vec<Queue>> {
        let mut queues = self.store.list_queues().await?;
        queues.retain(|q| q.is_active());
        Ok(queues)
    }

    /// Resolves the queue a new job goes to and the priority it gets.
    pub async fn admit(
        &self,
        name: &str,
        priority: Option<Priority>,
    ) -> Result<(Queue, Priority)> {
        let queue = self
            .store
            .get_queue(name)
            .await?
            .ok_or_else(|| ValidationError::UnknownQueue(name.to_string()))?;
        if !queue.is_active() {
            return Err(ValidationError::InactiveQueue(name.to_string()).into());
        }
        let priority = priority.unwrap_or_else(|| queue.default_priority());
        if !queue.allows_priority(priority) {
            return Err(ValidationError::DisallowedPriority {
                queue: name.to_string(),
                priority,
            }
            .into());
        }
        Ok((queue, priority))
    }

    /// Creates the `default` queue with default settings unless it exists.
    pub async fn ensure_default_queue(&self) -> Result<()> {
        if self.store.get_queue(Queue::DEFAULT_QUEUE_NAME).await?.is_some() {
            return Ok(());
        }
        match self
            .create_queue(Queue::builder(Queue::DEFAULT_QUEUE_NAME).build())
            .await
        {
            Ok(_) | Err(HiveWorkerError::Validation(ValidationError::DuplicateQueue(_))) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
