use std::future::Future;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::task_result::{RunTaskError, SpawnTaskResult, TaskOutput};

/// Runs `task` on its own tokio task under a hard deadline.
///
/// The task is aborted when `deadline` elapses or when `abort_token` is
/// cancelled, whichever comes first. A panic inside the task is caught and
/// reported as [`RunTaskError::TaskPanic`]; it never reaches the caller.
pub async fn spawn_task<F>(
    task: F,
    deadline: Duration,
    abort_token: CancellationToken,
) -> SpawnTaskResult
where
    F: Future<Output = Result<TaskOutput, RunTaskError>> + Send + 'static,
{
    let start = Instant::now();
    let handle = tokio::spawn(task);
    let abort_handle = handle.abort_handle();

    let result = tokio::select! {
        res = tokio::time::timeout(deadline, handle) => match res {
            Err(_) => {
                abort_handle.abort();
                Err(RunTaskError::TaskTimedOut(deadline))
            }
            Ok(Err(join_error)) if join_error.is_panic() => Err(RunTaskError::TaskPanic),
            Ok(Err(_)) => Err(RunTaskError::TaskAborted),
            Ok(Ok(result)) => result,
        },
        _ = abort_token.cancelled() => {
            abort_handle.abort();
            Err(RunTaskError::TaskAborted)
        }
    };

    SpawnTaskResult {
        duration: start.elapsed(),
        result,
    }
}
