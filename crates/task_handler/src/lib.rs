mod handler;
mod runner;
mod task_result;

pub use handler::{run_task_from_job_ctx, IntoTaskHandlerResult, TaskHandler};
pub use runner::spawn_task;
pub use task_result::{RunTaskError, SpawnTaskResult, TaskOutput};
