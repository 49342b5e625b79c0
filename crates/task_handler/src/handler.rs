use std::fmt::Debug;
use std::future::Future;

use hive_worker_ctx::JobContext;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::task_result::{RunTaskError, TaskOutput};

/// Conversion of whatever a handler returns into the worker's outcome.
///
/// Implemented for `()` and for any `Result<T, E>` where `T` is serializable
/// (it becomes the job's stored result) and `E` is `Debug` (it becomes the
/// job's `last_error`).
pub trait IntoTaskHandlerResult {
    fn into_task_handler_result(self) -> Result<TaskOutput, String>;
}

impl IntoTaskHandlerResult for () {
    fn into_task_handler_result(self) -> Result<TaskOutput, String> {
        Ok(None)
    }
}

impl<T: Serialize, E: Debug> IntoTaskHandlerResult for Result<T, E> {
    fn into_task_handler_result(self) -> Result<TaskOutput, String> {
        match self {
            Ok(value) => match serde_json::to_value(value) {
                Ok(Value::Null) => Ok(None),
                Ok(value) => Ok(Some(value)),
                Err(e) => Err(format!("Could not serialize task result: {e}")),
            },
            Err(e) => Err(format!("{e:?}")),
        }
    }
}

/// A job type together with the shape of its payload.
///
/// The payload type itself implements the trait; the worker deserializes the
/// stored JSON payload into `Self` before calling [`TaskHandler::run`].
///
/// ```
/// use hive_worker_ctx::JobContext;
/// use hive_worker_task_handler::{IntoTaskHandlerResult, TaskHandler};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Deserialize, Serialize)]
/// struct DeliverWebhook {
///     endpoint: String,
/// }
///
/// impl TaskHandler for DeliverWebhook {
///     const IDENTIFIER: &'static str = "deliver_webhook";
///
///     async fn run(self, _ctx: JobContext) -> impl IntoTaskHandlerResult {
///         Ok::<_, String>(serde_json::json!({ "status": 200 }))
///     }
/// }
/// ```
pub trait TaskHandler: Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static {
    const IDENTIFIER: &'static str;

    fn run(self, ctx: JobContext) -> impl Future<Output = impl IntoTaskHandlerResult> + Send;
}

/// Deserializes the job payload into `T` and runs it.
pub async fn run_task_from_job_ctx<T: TaskHandler>(
    ctx: JobContext,
) -> Result<TaskOutput, RunTaskError> {
    let payload = serde_json::from_value::<T>(ctx.payload().clone())
        .map_err(|e| RunTaskError::InvalidPayload(e.to_string()))?;

    payload
        .run(ctx)
        .await
        .into_task_handler_result()
        .map_err(RunTaskError::TaskError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_worker_job::Job;
    use tokio_util::sync::CancellationToken;

    #[derive(Serialize, Deserialize)]
    struct Greet {
        name: String,
    }

    impl TaskHandler for Greet {
        const IDENTIFIER: &'static str = "greet";

        async fn run(self, _ctx: JobContext) -> impl IntoTaskHandlerResult {
            if self.name.is_empty() {
                return Err("empty name");
            }
            Ok(format!("hello {}", self.name))
        }
    }

    fn ctx_with_payload(payload: Value) -> JobContext {
        let job = Job::builder().job_type("greet").payload(payload).build();
        JobContext::new(job, "worker".into(), CancellationToken::new())
    }

    #[tokio::test]
    async fn runs_handler_with_deserialized_payload() {
        let ctx = ctx_with_payload(serde_json::json!({ "name": "ada" }));
        let result = run_task_from_job_ctx::<Greet>(ctx).await;
        assert_eq!(result, Ok(Some(serde_json::json!("hello ada"))));
    }

    #[tokio::test]
    async fn handler_error_is_reported_as_task_error() {
        let ctx = ctx_with_payload(serde_json::json!({ "name": "" }));
        let result = run_task_from_job_ctx::<Greet>(ctx).await;
        assert!(matches!(result, Err(RunTaskError::TaskError(msg)) if msg.contains("empty name")));
    }

    #[tokio::test]
    async fn malformed_payload_is_not_retryable() {
        let ctx = ctx_with_payload(serde_json::json!({ "nom": 1 }));
        let err = run_task_from_job_ctx::<Greet>(ctx).await.unwrap_err();
        assert!(matches!(err, RunTaskError::InvalidPayload(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn unit_results_store_nothing() {
        assert_eq!(().into_task_handler_result(), Ok(None));
        assert_eq!(Ok::<(), String>(()).into_task_handler_result(), Ok(None));
        assert_eq!(
            Err::<(), _>(anyhow::anyhow!("boom"))
                .into_task_handler_result()
                .map_err(|e| e.contains("boom")),
            Err(true)
        );
    }
}
