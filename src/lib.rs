//! # hive_worker
//!
//! Durable, prioritized, multi-queue background job engine.
//!
//! Jobs are enqueued with a type and an opaque JSON payload on a named queue.
//! Workers poll the active queues, claim eligible jobs with a
//! compare-and-swap on their status and run the handler registered for the
//! job type under a hard deadline. Failures are retried with exponential
//! backoff until the attempt budget is spent, after which the job is
//! dead-lettered. Queues carry their own capacity, rate limit, retry and
//! retention policy; jobs may depend on other jobs.
//!
//! ```no_run
//! use hive_worker::{
//!     IntoTaskHandlerResult, JobContext, JobSpecBuilder, MemoryJobStore, Priority, TaskHandler,
//!     WorkerOptions,
//! };
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Deserialize, Serialize)]
//! struct DeliverWebhook {
//!     url: String,
//! }
//!
//! impl TaskHandler for DeliverWebhook {
//!     const IDENTIFIER: &'static str = "deliver_webhook";
//!
//!     async fn run(self, _ctx: JobContext) -> impl IntoTaskHandlerResult {
//!         Ok::<_, String>(serde_json::json!({ "status": 200 }))
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let worker = WorkerOptions::default()
//!     .store(Arc::new(MemoryJobStore::new()))
//!     .define_job::<DeliverWebhook>()
//!     .init()
//!     .await?;
//!
//! let utils = worker.create_utils();
//! utils
//!     .add_job(
//!         DeliverWebhook { url: "https://example.com/hook".into() },
//!         JobSpecBuilder::new().priority(Priority::High).build(),
//!     )
//!     .await?;
//!
//! worker.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod dependency;
mod dispatcher;
pub mod errors;
pub mod health;
mod in_flight;
pub mod job_spec;
pub mod queues;
pub mod rate_limiter;
pub mod retention;
pub mod retry;
pub mod runner;
mod sql;
pub mod store;
mod streams;
mod utils;
pub mod worker_utils;

pub use crate::builder::{WorkerBuildError, WorkerOptions};
pub use crate::errors::{HiveWorkerError, ValidationError};
pub use crate::health::{HealthMonitor, HealthReport};
pub use crate::job_spec::{JobSpec, JobSpecBuilder};
pub use crate::queues::QueueRegistry;
pub use crate::rate_limiter::{RateLimit, RateLimiter};
pub use crate::retention::{RetentionSweeper, SweepReport};
pub use crate::retry::{backoff_delay, FailureOutcome, RetryManager};
pub use crate::runner::{ReleaseJobError, Worker, WorkerFn, WorkerRuntimeError};
pub use crate::store::{
    Claim, ClaimLimits, JobFilter, JobFilterBuilder, JobStore, MemoryJobStore, PgJobStore,
    WorkerFilter,
};
pub use crate::worker_utils::{CleanupReport, CleanupTask, WorkerInfo, WorkerUtils};

pub use hive_worker_ctx::JobContext;
pub use hive_worker_job::{
    Job, JobError, JobStatus, Lease, NewJob, Priority, Queue, QueueBuilder, Transition,
    WorkerRecord, WorkerStatus,
};
pub use hive_worker_task_handler::{IntoTaskHandlerResult, RunTaskError, TaskHandler};
