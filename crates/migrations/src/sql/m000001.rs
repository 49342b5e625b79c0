use indoc::indoc;

use super::HiveWorkerMigration;

pub const M000001_MIGRATION: HiveWorkerMigration = HiveWorkerMigration {
    name: "m000001",
    is_breaking: false,
    stmts: &[
        indoc! {r#"
            create table :HIVE_WORKER_SCHEMA.queues (
                name text primary key,
                is_active boolean not null default true,
                max_workers int not null default 10 check (max_workers > 0),
                max_jobs_per_worker int not null default 5 check (max_jobs_per_worker > 0),
                rate_limit_per_minute int check (rate_limit_per_minute > 0),
                rate_limit_per_hour int check (rate_limit_per_hour > 0),
                default_max_attempts smallint not null default 3 check (default_max_attempts > 0),
                default_timeout_seconds int not null default 300 check (default_timeout_seconds > 0),
                retry_delay_base_seconds bigint not null default 60,
                retry_delay_max_seconds bigint not null default 3600,
                dead_letter_queue_name text,
                dead_letter_after_attempts smallint check (dead_letter_after_attempts > 0),
                allowed_priorities text[] not null default array['low', 'normal', 'high', 'critical'],
                retention_completed_hours int not null default 24,
                retention_failed_hours int not null default 168,
                created_at timestamptz not null default now()
            );
        "#},
        indoc! {r#"
            create table :HIVE_WORKER_SCHEMA.jobs (
                id bigint primary key generated always as identity,
                job_type text not null check (length(job_type) > 0),
                payload jsonb not null default '{}'::jsonb,
                queue_name text not null references :HIVE_WORKER_SCHEMA.queues (name),
                priority smallint not null default 1,
                status text not null default 'pending',
                attempts smallint not null default 0,
                max_attempts smallint not null default 3 check (max_attempts > 0),
                timeout_seconds int not null default 300,
                depends_on bigint[] not null default '{}',
                parent_job_id bigint,
                scheduled_at timestamptz not null default now(),
                created_at timestamptz not null default now(),
                updated_at timestamptz not null default now(),
                started_at timestamptz,
                completed_at timestamptz,
                context jsonb not null default '{}'::jsonb,
                created_by text not null default '',
                tenant_id text,
                last_error text,
                last_error_trace text,
                result jsonb,
                locked_by text,
                constraint jobs_attempts_within_budget check (attempts <= max_attempts)
            );
        "#},
        indoc! {r#"
            create table :HIVE_WORKER_SCHEMA.workers (
                id text primary key,
                status text not null default 'idle',
                environment text not null,
                last_heartbeat timestamptz not null default now(),
                current_job_ids bigint[] not null default '{}',
                started_at timestamptz not null default now()
            );
        "#},
    ],
};
