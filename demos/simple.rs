use std::sync::Arc;
use std::time::Duration;

use hive_worker::{
    IntoTaskHandlerResult, JobContext, JobSpecBuilder, MemoryJobStore, Priority, Queue,
    TaskHandler, WorkerOptions,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Deserialize, Serialize)]
struct SayHello {
    message: String,
}

impl TaskHandler for SayHello {
    const IDENTIFIER: &'static str = "say_hello";

    async fn run(self, ctx: JobContext) -> impl IntoTaskHandlerResult {
        println!("Hello {} ! (attempt {})", self.message, ctx.attempt());
        Ok::<_, String>(serde_json::json!({ "greeted": self.message }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // PostgreSQL when DATABASE_URL is set, in-memory otherwise
    let options = match std::env::var("DATABASE_URL") {
        Ok(url) => WorkerOptions::default()
            .database_url(&url)
            .schema("example_simple_worker"),
        Err(_) => WorkerOptions::default().store(Arc::new(MemoryJobStore::new())),
    };

    let worker = options
        .concurrency(2)
        .poll_interval(Duration::from_millis(250))
        .define_job::<SayHello>()
        .init()
        .await?;

    let utils = worker.create_utils();
    if utils.get_queue("greetings").await.is_err() {
        utils
            .create_queue(
                Queue::builder("greetings")
                    .rate_limit_per_minute(30)
                    .retry_delay_base_seconds(5)
                    .build(),
            )
            .await?;
    }

    for (message, priority) in [
        ("world", Priority::Normal),
        ("urgent world", Priority::Critical),
    ] {
        utils
            .add_job(
                SayHello {
                    message: message.into(),
                },
                JobSpecBuilder::new()
                    .queue("greetings")
                    .priority(priority)
                    .build(),
            )
            .await?;
    }
    utils
        .add_job(
            SayHello {
                message: "later".into(),
            },
            JobSpecBuilder::new()
                .queue("greetings")
                .delay(Duration::from_secs(3))
                .build(),
        )
        .await?;

    // Runs until Ctrl-C
    worker.run().await?;
    Ok(())
}
