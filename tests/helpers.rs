#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use hive_worker::{Job, JobStatus, JobStore, MemoryJobStore, WorkerOptions, WorkerUtils};
use sqlx::postgres::PgConnectOptions;
use sqlx::PgPool;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::LocalSet;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// A worker environment backed by the in-memory store.
#[derive(Clone)]
pub struct TestStore {
    pub store: Arc<MemoryJobStore>,
}

impl TestStore {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryJobStore::new()),
        }
    }

    pub fn create_worker_options(&self) -> WorkerOptions {
        WorkerOptions::default()
            .store(self.store.clone())
            .concurrency(4)
            .poll_interval(Duration::from_millis(20))
    }

    pub fn worker_utils(&self) -> WorkerUtils {
        WorkerUtils::new(self.store.clone())
    }

    pub async fn get_job(&self, id: i64) -> Job {
        self.store
            .get_job(id)
            .await
            .expect("Failed to get job")
            .expect("Job should exist")
    }

    pub async fn get_jobs(&self) -> Vec<Job> {
        self.store
            .list_jobs(&Default::default())
            .await
            .expect("Failed to list jobs")
    }

    /// Polls until the job reaches `status`, panics after 5 seconds.
    pub async fn wait_for_status(&self, id: i64, status: JobStatus) -> Job {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let job = self.get_job(id).await;
            if job.status() == status {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {id} stayed {} instead of becoming {status}",
                job.status()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[derive(Clone, Debug)]
pub struct TestDatabase {
    pub source_pool: PgPool,
    pub test_pool: PgPool,
    pub name: String,
}

impl TestDatabase {
    async fn drop(&self) {
        self.test_pool.close().await;
        sqlx::query(&format!("DROP DATABASE {} WITH (FORCE)", self.name))
            .execute(&self.source_pool)
            .await
            .expect("Failed to drop test database");
    }

    pub fn create_worker_options(&self) -> WorkerOptions {
        WorkerOptions::default()
            .pg_pool(self.test_pool.clone())
            .schema("hive_worker")
            .concurrency(4)
            .poll_interval(Duration::from_millis(20))
    }

    pub async fn count_jobs_with_status(&self, status: JobStatus) -> i64 {
        sqlx::query_scalar("select count(*) from hive_worker.jobs where status = $1")
            .bind(status.as_str())
            .fetch_one(&self.test_pool)
            .await
            .expect("Failed to count jobs")
    }
}

async fn create_test_database(db_url: &str) -> TestDatabase {
    let mut pg_conn_options: PgConnectOptions =
        db_url.parse().expect("Failed to parse DATABASE_URL");
    pg_conn_options = pg_conn_options.application_name("__test_hive_worker");

    let pg_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(4)
        .connect_with(pg_conn_options.clone())
        .await
        .expect("Failed to connect to database");

    let db_id = uuid::Uuid::now_v7();
    let db_name = format!("__test_hive_worker_{}", db_id.simple());

    sqlx::query(&format!("CREATE DATABASE {}", db_name))
        .execute(&pg_pool)
        .await
        .expect("Failed to create test database");

    let test_options = pg_conn_options.database(&db_name);

    let test_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(8)
        .connect_with(test_options)
        .await
        .expect("Failed to connect to test database");

    TestDatabase {
        source_pool: pg_pool,
        test_pool,
        name: db_name,
    }
}

/// Runs `test_fn` against a fresh database. Skipped when `DATABASE_URL` is
/// not set.
pub async fn with_test_db<F, Fut>(test_fn: F)
where
    F: FnOnce(TestDatabase) -> Fut + 'static,
    Fut: Future<Output = ()> + 'static,
{
    let Ok(db_url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL is not set, skipping PostgreSQL test");
        return;
    };

    let local_set = LocalSet::new();

    local_set
        .run_until(async move {
            let test_db = create_test_database(&db_url).await;
            let test_db_2 = test_db.clone();

            let result = tokio::task::spawn_local(async move {
                test_fn(test_db_2).await;
            })
            .await;

            test_db.drop().await;
            result.expect("Test failed");
        })
        .await;
}

pub struct StaticCounter {
    cell: OnceCell<Mutex<u32>>,
}

async fn init_job_count() -> Mutex<u32> {
    Mutex::new(0)
}

impl StaticCounter {
    pub const fn new() -> Self {
        Self {
            cell: OnceCell::const_new(),
        }
    }

    pub async fn increment(&self) -> u32 {
        let cell = self.cell.get_or_init(init_job_count).await;
        let mut count = cell.lock().await;
        *count += 1;
        *count
    }

    pub async fn get(&self) -> u32 {
        let cell = self.cell.get_or_init(init_job_count).await;
        *cell.lock().await
    }
}

pub async fn enable_logs() {
    static ONCE: OnceCell<()> = OnceCell::const_new();

    ONCE.get_or_init(|| async {
        let fmt_layer = tracing_subscriber::fmt::layer();
        // Debug for the crate, warn for sqlx so queries stay out of the output
        let filter_layer = EnvFilter::try_new("debug,sqlx=warn").unwrap();

        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .init();
    })
    .await;
}
