//! Postgres-backed [`CommandAuditRepository`] (spec.md §4.12, §4.15, C12/C14).

use anyhow::Context;
use async_trait::async_trait;
use ddd_audit::{CommandAudit, CommandAuditError, CommandAuditRepository, CommandOutcome};
use ddd_schemas::{CommandAuditStatus, CommandSource, TenantId};
use sqlx::{PgPool, Row};

pub struct PgCommandAuditRepository {
    pool: PgPool,
}

impl PgCommandAuditRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const AUDIT_COLUMNS: &str = "command_id, correlation_id, command_name, status, source, source_id, \
     started_at, finished_at, duration_ms, peak_memory_bytes, parameters, events, \
     error_type, error_message, error_code, blog_id";

fn row_to_audit(row: sqlx::postgres::PgRow) -> anyhow::Result<CommandAudit> {
    let events: serde_json::Value = row.try_get("events")?;
    let events = events
        .as_array()
        .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    let error_type: Option<String> = row.try_get("error_type")?;
    let error_message: Option<String> = row.try_get("error_message")?;
    let error_code: Option<String> = row.try_get("error_code")?;
    let error = error_type.map(|error_type| CommandAuditError {
        error_type,
        message: error_message.unwrap_or_default(),
        code: error_code,
    });

    Ok(CommandAudit {
        command_id: row.try_get("command_id")?,
        correlation_id: row.try_get("correlation_id")?,
        command_name: row.try_get("command_name")?,
        status: CommandAuditStatus::parse(row.try_get::<String, _>("status")?.as_str())?,
        source: CommandSource::parse(row.try_get::<String, _>("source")?.as_str())?,
        source_id: row.try_get("source_id")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        duration_ms: row.try_get("duration_ms")?,
        peak_memory_bytes: row.try_get("peak_memory_bytes")?,
        parameters: row.try_get("parameters")?,
        events,
        error,
        blog_id: TenantId(row.try_get("blog_id")?),
    })
}

#[async_trait]
impl CommandAuditRepository for PgCommandAuditRepository {
    async fn start(&self, audit: CommandAudit) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            insert into command_audit
                (command_id, correlation_id, command_name, status, source, source_id,
                 started_at, parameters, events, blog_id)
            values ($1, $2, $3, $4, $5, $6, $7, $8, '[]', $9)
            "#,
        )
        .bind(audit.command_id)
        .bind(audit.correlation_id)
        .bind(&audit.command_name)
        .bind(audit.status.as_str())
        .bind(audit.source.as_str())
        .bind(&audit.source_id)
        .bind(audit.started_at)
        .bind(&audit.parameters)
        .bind(audit.blog_id.0)
        .execute(&self.pool)
        .await
        .context("audit start failed")?;
        Ok(())
    }

    async fn finish(&self, command_id: uuid::Uuid, outcome: CommandOutcome) -> anyhow::Result<()> {
        let events = serde_json::to_value(&outcome.events)?;
        let result = sqlx::query(
            r#"
            update command_audit
               set status = $2, finished_at = $3, duration_ms = $4, peak_memory_bytes = $5,
                   events = $6, error_type = $7, error_message = $8, error_code = $9
             where command_id = $1
            "#,
        )
        .bind(command_id)
        .bind(outcome.status.as_str())
        .bind(outcome.finished_at)
        .bind(outcome.duration_ms)
        .bind(outcome.peak_memory_bytes)
        .bind(&events)
        .bind(outcome.error.as_ref().map(|e| e.error_type.as_str()))
        .bind(outcome.error.as_ref().map(|e| e.message.as_str()))
        .bind(outcome.error.as_ref().and_then(|e| e.code.as_deref()))
        .execute(&self.pool)
        .await
        .context("audit finish failed")?;
        if result.rows_affected() == 0 {
            anyhow::bail!("no preflight audit row for command {command_id}");
        }
        Ok(())
    }

    async fn find(&self, command_id: uuid::Uuid) -> anyhow::Result<Option<CommandAudit>> {
        let query = format!("select {AUDIT_COLUMNS} from command_audit where command_id = $1");
        let row = sqlx::query(&query)
            .bind(command_id)
            .fetch_optional(&self.pool)
            .await
            .context("audit find failed")?;
        row.map(row_to_audit).transpose()
    }
}
