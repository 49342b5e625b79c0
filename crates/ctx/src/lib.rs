use getset::Getters;
use hive_worker_job::Job;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Everything a handler receives besides its deserialized payload.
///
/// Cancellation is cooperative: when a running job is cancelled the worker
/// triggers [`JobContext::cancellation_token`] on its next heartbeat, and
/// long-running handlers are expected to check [`JobContext::is_cancelled`]
/// or await [`JobContext::cancelled`].
#[derive(Getters, Clone, Debug)]
#[getset(get = "pub")]
pub struct JobContext {
    job: Job,
    worker_id: String,
    cancellation_token: CancellationToken,
}

impl JobContext {
    pub fn new(job: Job, worker_id: String, cancellation_token: CancellationToken) -> Self {
        JobContext {
            job,
            worker_id,
            cancellation_token,
        }
    }

    pub fn payload(&self) -> &Value {
        self.job.payload()
    }

    /// Metadata the job was enqueued with (request ids, actor, locale...).
    pub fn context(&self) -> &Value {
        self.job.context()
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.job.tenant_id().as_deref()
    }

    pub fn attempt(&self) -> i16 {
        self.job.attempts()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancellation_token.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancellation_is_visible_to_clones() {
        let job = Job::builder()
            .job_type("generate_report")
            .context(serde_json::json!({ "request_id": "r-1" }))
            .tenant_id("org_9")
            .build();
        let token = CancellationToken::new();
        let ctx = JobContext::new(job, "worker_1".into(), token.clone());
        let clone = ctx.clone();

        assert!(!clone.is_cancelled());
        token.cancel();
        clone.cancelled().await;
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.context()["request_id"], "r-1");
        assert_eq!(ctx.tenant_id(), Some("org_9"));
    }
}
