use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use hive_worker::dependency::DEPENDENCY_FAILED;
use hive_worker::{
    Claim, ClaimLimits, JobError, JobFilter, JobSpecBuilder, JobStatus, JobStore, PgJobStore,
    Priority, Queue, Transition, WorkerStatus,
};
use serde_json::json;

use crate::helpers::{with_test_db, StaticCounter};

mod helpers;

#[tokio::test]
async fn it_should_migrate_and_register_the_worker() {
    with_test_db(|test_db| async move {
        let worker = test_db
            .create_worker_options()
            .worker_id("w_pg")
            .environment("ci")
            .init()
            .await
            .expect("Failed to create worker");

        let migrations: i64 = sqlx::query_scalar("select count(*) from hive_worker.migrations")
            .fetch_one(&test_db.test_pool)
            .await
            .expect("Failed to count migrations");
        assert_eq!(migrations, 3);

        let utils = worker.create_utils();
        // Running migrations again is a no-op
        utils.migrate().await.expect("Failed to migrate again");

        let queues = utils.list_queues().await.unwrap();
        assert_eq!(queues.len(), 1);
        assert_eq!(queues[0].name(), Queue::DEFAULT_QUEUE_NAME);

        let workers = utils.list_workers(&Default::default()).await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].record().id(), "w_pg");
        assert_eq!(workers[0].record().environment(), "ci");
        assert_eq!(*workers[0].record().status(), WorkerStatus::Idle);
    })
    .await;
}

#[tokio::test]
async fn it_should_run_jobs_with_dependencies() {
    static JOB_CALL_COUNT: StaticCounter = StaticCounter::new();

    with_test_db(|test_db| async move {
        let worker = test_db
            .create_worker_options()
            .define_raw_job("step", |payload, _ctx| async move {
                JOB_CALL_COUNT.increment().await;
                Ok::<_, String>(json!({ "seen": payload["name"] }))
            })
            .define_raw_job("explode", |_payload, _ctx| async move {
                Err::<(), _>("boom")
            })
            .init()
            .await
            .expect("Failed to create worker");
        let utils = worker.create_utils();

        let a = utils
            .add_raw_job("step", json!({ "name": "a" }), Default::default())
            .await
            .unwrap();
        let b = utils
            .add_raw_job(
                "step",
                json!({ "name": "b" }),
                JobSpecBuilder::new()
                    .priority(Priority::Critical)
                    .depends_on(vec![a.id()])
                    .build(),
            )
            .await
            .unwrap();
        let broken = utils
            .add_raw_job(
                "explode",
                json!({}),
                JobSpecBuilder::new().max_attempts(1).build(),
            )
            .await
            .unwrap();
        let orphan = utils
            .add_raw_job(
                "step",
                json!({ "name": "orphan" }),
                JobSpecBuilder::new().depends_on(vec![broken.id()]).build(),
            )
            .await
            .unwrap();

        worker.run_once().await.expect("Failed to run worker");

        assert_eq!(JOB_CALL_COUNT.get().await, 2);
        let a = utils.get_job(a.id()).await.unwrap();
        let b = utils.get_job(b.id()).await.unwrap();
        assert_eq!(a.status(), JobStatus::Completed);
        assert_eq!(b.status(), JobStatus::Completed);
        assert_eq!(b.result(), &Some(json!({ "seen": "b" })));
        assert!(b.started_at().unwrap() >= a.completed_at().unwrap());

        assert_eq!(
            utils.get_job(broken.id()).await.unwrap().status(),
            JobStatus::DeadLettered
        );
        let orphan = utils.get_job(orphan.id()).await.unwrap();
        assert_eq!(orphan.status(), JobStatus::Failed);
        assert_eq!(orphan.last_error().as_deref(), Some(DEPENDENCY_FAILED));

        assert_eq!(test_db.count_jobs_with_status(JobStatus::Completed).await, 2);
    })
    .await;
}

#[tokio::test]
async fn it_should_let_exactly_one_concurrent_claim_win() {
    with_test_db(|test_db| async move {
        let store = Arc::new(
            PgJobStore::connect(test_db.test_pool.clone(), "hive_worker")
                .await
                .unwrap(),
        );
        store.migrate().await.unwrap();
        store
            .create_queue(Queue::builder(Queue::DEFAULT_QUEUE_NAME).build())
            .await
            .unwrap();
        let utils = hive_worker::WorkerUtils::new(store.clone());
        let job = utils
            .add_raw_job("contended", json!({}), Default::default())
            .await
            .unwrap();

        let now = Utc::now();
        let job_id = job.id();
        let claims = join_all((0..8).map(|i| {
            let store = store.clone();
            async move { store.claim_job(job_id, &format!("w_{i}"), now).await }
        }))
        .await;

        let winners: Vec<_> = claims
            .into_iter()
            .filter_map(|claim| claim.expect("Claim should not error"))
            .collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].status(), JobStatus::Running);
        assert_eq!(winners[0].attempts(), 1);
    })
    .await;
}

#[tokio::test]
async fn it_should_cancel_retry_and_purge() {
    with_test_db(|test_db| async move {
        let worker = test_db
            .create_worker_options()
            .define_raw_job("noop", |_payload, _ctx| async move {})
            .init()
            .await
            .expect("Failed to create worker");
        let utils = worker.create_utils();

        let cancelled = utils
            .add_raw_job("noop", json!({}), Default::default())
            .await
            .unwrap();
        assert!(utils.cancel_job(cancelled.id()).await.unwrap());
        assert!(!utils.cancel_job(cancelled.id()).await.unwrap());

        worker.run_once().await.expect("Failed to run worker");
        assert_eq!(
            utils.get_job(cancelled.id()).await.unwrap().status(),
            JobStatus::Cancelled
        );

        assert!(!utils.retry_job(cancelled.id()).await.unwrap());

        let pending = utils
            .list_jobs(&JobFilter::builder().status(JobStatus::Pending).build())
            .await
            .unwrap();
        assert!(pending.is_empty());

        // Nothing is old enough to be purged yet
        let report = utils
            .cleanup(&[hive_worker::CleanupTask::PurgeExpiredJobs])
            .await
            .unwrap();
        assert_eq!(report.purged_jobs.total(), 0);

        sqlx::query(
            "update hive_worker.jobs set completed_at = now() - interval '200 hours' where id = $1",
        )
        .bind(cancelled.id())
        .execute(&test_db.test_pool)
        .await
        .unwrap();
        let report = utils
            .cleanup(&[hive_worker::CleanupTask::PurgeExpiredJobs])
            .await
            .unwrap();
        assert_eq!(report.purged_jobs.failed, 1);
        assert!(utils.get_job(cancelled.id()).await.is_err());
    })
    .await;
}

#[tokio::test]
async fn it_should_enforce_queue_limits_across_stores() {
    with_test_db(|test_db| async move {
        let connect = || PgJobStore::connect(test_db.test_pool.clone(), "hive_worker");
        let first = Arc::new(connect().await.unwrap());
        first.migrate().await.unwrap();
        let second = Arc::new(connect().await.unwrap());
        let queue = first
            .create_queue(
                Queue::builder("sms")
                    .rate_limit_per_minute(10)
                    .max_jobs_per_worker(20)
                    .build(),
            )
            .await
            .unwrap();
        let utils = hive_worker::WorkerUtils::new(first.clone());
        let mut ids = Vec::new();
        for i in 0..30 {
            let job = utils
                .add_raw_job(
                    "send_sms",
                    json!({ "n": i }),
                    JobSpecBuilder::new().queue("sms").build(),
                )
                .await
                .unwrap();
            ids.push(job.id());
        }

        let limits = ClaimLimits::for_queue(&queue);
        let now = Utc::now();
        let stores = [first.clone(), second.clone()];
        let claims = join_all(ids.iter().enumerate().map(|(i, id)| {
            let store = stores[i % 2].clone();
            let limits = limits;
            async move {
                store
                    .claim_job_within(*id, &format!("w_{}", i % 2), now, &limits)
                    .await
            }
        }))
        .await;

        let claimed = claims
            .into_iter()
            .map(|claim| claim.expect("Claim should not error"))
            .filter(|claim| matches!(claim, Claim::Claimed(_)))
            .count();
        assert_eq!(claimed, 10);
        assert_eq!(test_db.count_jobs_with_status(JobStatus::Running).await, 10);
        assert_eq!(test_db.count_jobs_with_status(JobStatus::Pending).await, 20);
    })
    .await;
}

#[tokio::test]
async fn it_should_reject_outcomes_of_a_replaced_attempt() {
    with_test_db(|test_db| async move {
        let store = Arc::new(
            PgJobStore::connect(test_db.test_pool.clone(), "hive_worker")
                .await
                .unwrap(),
        );
        store.migrate().await.unwrap();
        store
            .create_queue(Queue::builder(Queue::DEFAULT_QUEUE_NAME).build())
            .await
            .unwrap();
        let utils = hive_worker::WorkerUtils::new(store.clone());
        let job = utils
            .add_raw_job("slow", json!({}), Default::default())
            .await
            .unwrap();

        let first = store
            .claim_job(job.id(), "w_old", Utc::now())
            .await
            .unwrap()
            .unwrap();
        let old_lease = first.lease().unwrap();
        store
            .transition(
                job.id(),
                &Transition::Retry {
                    run_at: Utc::now(),
                    error: JobError::new("worker w_old missed heartbeats"),
                    at: Utc::now(),
                },
                Some(&old_lease),
            )
            .await
            .unwrap()
            .unwrap();
        let second = store
            .claim_job(job.id(), "w_new", Utc::now())
            .await
            .unwrap()
            .unwrap();

        let late = store
            .transition(
                job.id(),
                &Transition::Complete {
                    result: None,
                    at: Utc::now(),
                },
                Some(&old_lease),
            )
            .await
            .unwrap();
        assert!(late.is_none());

        let completed = store
            .transition(
                job.id(),
                &Transition::Complete {
                    result: None,
                    at: Utc::now(),
                },
                Some(&second.lease().unwrap()),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completed.status(), JobStatus::Completed);
        assert_eq!(completed.attempts(), 2);
    })
    .await;
}
