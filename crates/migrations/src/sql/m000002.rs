use indoc::indoc;

use super::HiveWorkerMigration;

pub const M000002_MIGRATION: HiveWorkerMigration = HiveWorkerMigration {
    name: "m000002",
    is_breaking: false,
    stmts: &[
        // Dispatch order within a queue
        indoc! {r#"
            create index jobs_claimable_idx
                on :HIVE_WORKER_SCHEMA.jobs (queue_name, priority desc, created_at, id)
                where status in ('pending', 'scheduled', 'retrying');
        "#},
        indoc! {r#"
            create index jobs_running_idx
                on :HIVE_WORKER_SCHEMA.jobs (queue_name, locked_by)
                where status = 'running';
        "#},
        indoc! {r#"
            create index jobs_retention_idx
                on :HIVE_WORKER_SCHEMA.jobs (queue_name, status, completed_at)
                where completed_at is not null;
        "#},
        indoc! {r#"
            create index jobs_tenant_idx
                on :HIVE_WORKER_SCHEMA.jobs (tenant_id)
                where tenant_id is not null;
        "#},
        indoc! {r#"
            create index workers_heartbeat_idx
                on :HIVE_WORKER_SCHEMA.workers (status, last_heartbeat);
        "#},
    ],
};
