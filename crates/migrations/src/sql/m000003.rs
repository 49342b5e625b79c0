use indoc::indoc;

use super::HiveWorkerMigration;

pub const M000003_MIGRATION: HiveWorkerMigration = HiveWorkerMigration {
    name: "m000003",
    is_breaking: false,
    stmts: &[
        // One row per claim, counted by the rate-limit windows
        indoc! {r#"
            create table :HIVE_WORKER_SCHEMA.dispatches (
                id bigint primary key generated always as identity,
                queue_name text not null references :HIVE_WORKER_SCHEMA.queues (name) on delete cascade,
                job_id bigint not null,
                dispatched_at timestamptz not null
            );
        "#},
        indoc! {r#"
            create index dispatches_window_idx
                on :HIVE_WORKER_SCHEMA.dispatches (queue_name, dispatched_at);
        "#},
    ],
};
