//! Idempotent storage schema (spec.md §4.15, C14).
//!
//! The teacher's migration story (`mqk_db::migrate`) runs versioned `.sql`
//! files through `sqlx::migrate!`. This system has no migration history to
//! version — every table is declared with `CREATE TABLE IF NOT EXISTS` so a
//! fresh host and a long-lived one converge on the same schema by just
//! calling this once at startup. `migrate` is kept as a name alongside
//! `ensure_schema` for anyone porting call sites from that convention.

use anyhow::{Context, Result};
use sqlx::PgPool;

const STATEMENTS: &[&str] = &[
    r#"
    create table if not exists integration_outbox (
        id                  bigserial primary key,
        event_id            uuid not null unique,
        event_type          text not null,
        integration_action  text not null,
        message_kind        text not null,
        transport           text not null,
        queue               text,
        correlation_id      uuid not null,
        sequence            bigint not null,
        command_id          uuid,
        payload             jsonb not null,
        delay_seconds       bigint not null default 0,
        scheduled_at        timestamptz not null,
        is_unique           boolean not null default false,
        status              text not null default 'pending',
        attempts            integer not null default 0,
        max_attempts        integer not null default 5,
        next_attempt_at     timestamptz,
        locked_until        timestamptz,
        locked_by           text,
        last_error          text,
        error_history       jsonb not null default '[]',
        created_at          timestamptz not null default now(),
        processed_at        timestamptz,
        blog_id             bigint not null
    )
    "#,
    "create index if not exists integration_outbox_status_scheduled_idx on integration_outbox (status, scheduled_at)",
    "create index if not exists integration_outbox_status_next_attempt_idx on integration_outbox (status, next_attempt_at)",
    "create index if not exists integration_outbox_blog_status_idx on integration_outbox (blog_id, status)",
    "create index if not exists integration_outbox_correlation_idx on integration_outbox (correlation_id)",
    r#"
    create table if not exists integration_dlq (
        event_id      uuid primary key,
        event_type    text not null,
        payload       jsonb not null,
        attempts      integer not null,
        final_error   text not null,
        moved_at      timestamptz not null default now(),
        resolved_at   timestamptz,
        blog_id       bigint not null
    )
    "#,
    "create index if not exists integration_dlq_blog_idx on integration_dlq (blog_id)",
    r#"
    create table if not exists long_processes (
        id              bigserial primary key,
        process_class   text not null,
        business_data   jsonb not null,
        steps           jsonb not null,
        step_name       text not null,
        status          text not null default 'pending',
        waiting_for     text,
        match_criteria  jsonb,
        payload         jsonb,
        correlation_id  uuid not null,
        last_error      text,
        created_at      timestamptz not null default now(),
        updated_at      timestamptz not null default now(),
        blog_id         bigint not null
    )
    "#,
    "create index if not exists long_processes_waiting_for_status_idx on long_processes (waiting_for, status)",
    "create index if not exists long_processes_status_idx on long_processes (status)",
    "create index if not exists long_processes_correlation_idx on long_processes (correlation_id)",
    "create index if not exists long_processes_blog_status_idx on long_processes (blog_id, status)",
    r#"
    create table if not exists behaviour_workflows (
        id                  bigserial primary key,
        ref_id              text not null,
        ref_type            text not null,
        root_workflow_id    bigint references behaviour_workflows (id),
        behaviour_configs   jsonb not null,
        behaviour_results   jsonb not null,
        current_idx         bigint not null default 0,
        current_phase       integer not null default 1,
        is_complete         boolean not null default false,
        is_failed           boolean not null default false,
        meta                jsonb not null default '{}',
        blog_id             bigint not null,
        created_at          timestamptz not null default now(),
        updated_at          timestamptz not null default now()
    )
    "#,
    "create unique index if not exists behaviour_workflows_ref_idx on behaviour_workflows (ref_id, ref_type)",
    "create index if not exists behaviour_workflows_blog_idx on behaviour_workflows (blog_id)",
    r#"
    create table if not exists behaviour_workflow_items (
        id              bigserial primary key,
        workflow_id     bigint not null references behaviour_workflows (id),
        behaviour_idx   bigint not null,
        phase           integer not null,
        item_key        text not null,
        status          text not null default 'pending',
        attempts        integer not null default 0,
        last_error      text,
        payload         jsonb,
        blog_id         bigint not null,
        created_at      timestamptz not null default now(),
        updated_at      timestamptz not null default now()
    )
    "#,
    "create unique index if not exists behaviour_workflow_items_unique_idx \
     on behaviour_workflow_items (workflow_id, behaviour_idx, phase, item_key)",
    r#"
    create table if not exists command_audit (
        command_id          uuid primary key,
        correlation_id      uuid not null,
        command_name        text not null,
        status              text not null,
        source               text not null,
        source_id           text,
        started_at          timestamptz not null,
        finished_at         timestamptz,
        duration_ms         bigint,
        peak_memory_bytes   bigint,
        parameters          jsonb not null,
        events              jsonb not null default '[]',
        error_type          text,
        error_message       text,
        error_code          text,
        blog_id             bigint not null
    )
    "#,
    "create index if not exists command_audit_started_at_idx on command_audit (started_at)",
    "create index if not exists command_audit_command_name_idx on command_audit (command_name)",
    "create index if not exists command_audit_correlation_idx on command_audit (correlation_id)",
];

/// Apply every `CREATE TABLE IF NOT EXISTS` / `CREATE INDEX IF NOT EXISTS`
/// statement. Safe to call on every process start; each statement is a no-op
/// once the schema already exists.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for stmt in STATEMENTS {
        sqlx::query(stmt)
            .execute(pool)
            .await
            .with_context(|| format!("schema statement failed: {}", stmt.trim().lines().next().unwrap_or(stmt)))?;
    }
    Ok(())
}

/// Alias for [`ensure_schema`] for callers used to a `migrate` entry point.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    ensure_schema(pool).await
}
