use std::time::Duration;

use chrono::{DateTime, Utc};
use derive_builder::Builder;
use getset::{Getters, MutGetters, Setters};
use hive_worker_job::Priority;
use serde_json::Value;

/// Options for a job being added to a queue.
///
/// Every field is optional; whatever is left unset falls back to the target
/// queue's defaults when the job is enqueued.
///
/// ```
/// use hive_worker::{JobSpecBuilder, Priority};
/// use std::time::Duration;
///
/// let spec = JobSpecBuilder::new()
///     .queue("webhooks")
///     .priority(Priority::High)
///     .delay(Duration::from_secs(30))
///     .max_attempts(5)
///     .depends_on(vec![12, 13])
///     .tenant_id("org_42")
///     .build();
///
/// assert_eq!(spec.queue(), &Some("webhooks".to_string()));
/// ```
#[derive(Getters, Setters, MutGetters, Debug, Default, Clone, Builder)]
#[getset(get = "pub", set = "pub", get_mut = "pub")]
#[builder(
    build_fn(private, name = "build_internal"),
    setter(strip_option),
    default,
    pattern = "owned"
)]
pub struct JobSpec {
    /// Name of the queue to add the job to. Defaults to the `default` queue.
    #[builder(setter(into))]
    pub queue: Option<String>,

    /// Must be one of the queue's allowed priorities. Defaults to `normal`
    /// when allowed, otherwise to the lowest allowed priority.
    pub priority: Option<Priority>,

    /// Run the job no earlier than `now + delay`. Ignored when `scheduled_at`
    /// is also set.
    pub delay: Option<Duration>,

    /// Absolute time before which the job is not dispatched.
    #[builder(setter(into))]
    pub scheduled_at: Option<DateTime<Utc>>,

    /// Overrides the queue's `default_max_attempts`.
    pub max_attempts: Option<i16>,

    /// Overrides the queue's `default_timeout_seconds`.
    pub timeout: Option<Duration>,

    /// Jobs that must reach `completed` before this one may run.
    #[builder(setter(into))]
    pub depends_on: Option<Vec<i64>>,

    pub parent_job_id: Option<i64>,

    /// Metadata handed to the handler next to the payload.
    pub context: Option<Value>,

    #[builder(setter(into))]
    pub created_by: Option<String>,

    #[builder(setter(into))]
    pub tenant_id: Option<String>,
}

impl JobSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> JobSpecBuilder {
        JobSpecBuilder::new()
    }

    /// When the job becomes eligible for dispatch.
    pub(crate) fn resolve_scheduled_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(at) = self.scheduled_at {
            return at;
        }
        match self.delay.and_then(|d| chrono::Duration::from_std(d).ok()) {
            Some(delay) => now + delay,
            None => now,
        }
    }
}

impl JobSpecBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(self) -> JobSpec {
        self.build_internal()
            .expect("There is a default value for all fields")
    }
}

impl From<Option<JobSpec>> for JobSpec {
    fn from(spec: Option<JobSpec>) -> Self {
        spec.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_spec() {
        let now = Utc::now();
        let job_spec = JobSpecBuilder::new()
            .queue("reports")
            .scheduled_at(now)
            .max_attempts(3)
            .priority(Priority::Critical)
            .depends_on(vec![1, 2])
            .created_by("user:7")
            .build();

        assert_eq!(job_spec.queue(), &Some("reports".to_string()));
        assert_eq!(job_spec.scheduled_at(), &Some(now));
        assert_eq!(job_spec.max_attempts(), &Some(3));
        assert_eq!(job_spec.priority(), &Some(Priority::Critical));
        assert_eq!(job_spec.depends_on(), &Some(vec![1, 2]));
        assert_eq!(job_spec.created_by(), &Some("user:7".to_string()));
    }

    #[test]
    fn should_build_unset_job_spec_without_panic() {
        let spec = JobSpecBuilder::new().build();
        assert!(spec.queue().is_none());
    }

    #[test]
    fn explicit_schedule_wins_over_delay() {
        let now = Utc::now();
        let later = now + chrono::Duration::hours(1);
        let spec = JobSpecBuilder::new()
            .delay(Duration::from_secs(5))
            .scheduled_at(later)
            .build();
        assert_eq!(spec.resolve_scheduled_at(now), later);

        let spec = JobSpecBuilder::new().delay(Duration::from_secs(5)).build();
        assert_eq!(
            spec.resolve_scheduled_at(now),
            now + chrono::Duration::seconds(5)
        );
        assert_eq!(JobSpec::new().resolve_scheduled_at(now), now);
    }
}
