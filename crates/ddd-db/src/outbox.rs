//! Postgres-backed [`OutboxStore`] (spec.md §4.4, §4.15, C4/C14).
//!
//! `fetch_pending` mirrors the teacher's `outbox_claim_batch`: a `with
//! to_claim as (... for update skip locked) update ... returning ...` CTE, so
//! concurrent workers never claim the same row (spec.md §5 shared-resource
//! policy).

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use ddd_outbox::{BackoffPolicy, DlqEntry, NewOutboxEntry, OutboxEntry, OutboxStats, OutboxStore};
use ddd_schemas::{MessageKind, OutboxStatus, TenantId, Transport};
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub struct PgOutboxStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }
}

fn row_to_entry(row: sqlx::postgres::PgRow) -> anyhow::Result<OutboxEntry> {
    let payload: serde_json::Value = row.try_get("payload")?;
    let payload_bytes = serde_json::to_vec(&payload)?.len();
    let error_history: serde_json::Value = row.try_get("error_history")?;
    let error_history = error_history
        .as_array()
        .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    Ok(OutboxEntry {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        event_type: row.try_get("event_type")?,
        integration_action: row.try_get("integration_action")?,
        message_kind: MessageKind::parse(row.try_get::<String, _>("message_kind")?.as_str())?,
        transport: Transport::parse(row.try_get::<String, _>("transport")?.as_str())?,
        queue: row.try_get("queue")?,
        payload_bytes,
        correlation_id: row.try_get("correlation_id")?,
        sequence: row.try_get::<i64, _>("sequence")? as u64,
        command_id: row.try_get("command_id")?,
        payload,
        delay_seconds: row.try_get("delay_seconds")?,
        scheduled_at: row.try_get("scheduled_at")?,
        is_unique: row.try_get("is_unique")?,
        status: OutboxStatus::parse(row.try_get::<String, _>("status")?.as_str())?,
        attempts: row.try_get::<i32, _>("attempts")? as u32,
        max_attempts: row.try_get::<i32, _>("max_attempts")? as u32,
        next_attempt_at: row.try_get("next_attempt_at")?,
        locked_until: row.try_get("locked_until")?,
        locked_by: row.try_get("locked_by")?,
        last_error: row.try_get("last_error")?,
        error_history,
        created_at: row.try_get("created_at")?,
        processed_at: row.try_get("processed_at")?,
        blog_id: TenantId(row.try_get("blog_id")?),
    })
}

const ENTRY_COLUMNS: &str = "id, event_id, event_type, integration_action, message_kind, transport, queue, \
     correlation_id, sequence, command_id, payload, delay_seconds, scheduled_at, is_unique, status, \
     attempts, max_attempts, next_attempt_at, locked_until, locked_by, last_error, error_history, \
     created_at, processed_at, blog_id";

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn write(&self, entry: NewOutboxEntry) -> anyhow::Result<Uuid> {
        let event_id = Uuid::new_v4();
        let scheduled_at = chrono::Utc::now() + chrono::Duration::seconds(entry.delay_seconds.max(0));
        sqlx::query(
            r#"
            insert into integration_outbox
                (event_id, event_type, integration_action, message_kind, transport, queue,
                 correlation_id, sequence, command_id, payload, delay_seconds, scheduled_at,
                 is_unique, max_attempts, blog_id)
            values
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(event_id)
        .bind(&entry.event_type)
        .bind(&entry.integration_action)
        .bind(entry.message_kind.as_str())
        .bind(entry.transport.as_str())
        .bind(&entry.queue)
        .bind(entry.correlation_id)
        .bind(entry.sequence as i64)
        .bind(entry.command_id)
        .bind(&entry.payload)
        .bind(entry.delay_seconds.max(0))
        .bind(scheduled_at)
        .bind(entry.is_unique)
        .bind(entry.max_attempts as i32)
        .bind(entry.blog_id.0)
        .execute(&self.pool)
        .await
        .context("outbox write failed")?;
        Ok(event_id)
    }

    async fn fetch_pending(&self, limit: u32, worker_id: &str) -> anyhow::Result<Vec<OutboxEntry>> {
        let query = format!(
            r#"
            with to_claim as (
                select id
                from integration_outbox
                where status = 'pending'
                  and scheduled_at <= now()
                  and (next_attempt_at is null or next_attempt_at <= now())
                  and (locked_until is null or locked_until <= now())
                order by scheduled_at asc
                limit $1
                for update skip locked
            )
            update integration_outbox
               set status       = 'processing',
                   locked_until = now() + make_interval(secs => $2),
                   locked_by    = $3
             where id in (select id from to_claim)
            returning {ENTRY_COLUMNS}
            "#
        );
        let rows = sqlx::query(&query)
            .bind(limit as i64)
            .bind(self.lock_timeout.as_secs_f64())
            .bind(worker_id)
            .fetch_all(&self.pool)
            .await
            .context("outbox fetch_pending failed")?;
        rows.into_iter().map(row_to_entry).collect()
    }

    async fn find_by_event_id(&self, event_id: Uuid) -> anyhow::Result<Option<OutboxEntry>> {
        let query = format!("select {ENTRY_COLUMNS} from integration_outbox where event_id = $1");
        let row = sqlx::query(&query)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
            .context("outbox find_by_event_id failed")?;
        row.map(row_to_entry).transpose()
    }

    async fn mark_completed(&self, event_id: Uuid) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            update integration_outbox
               set status = 'completed', processed_at = now(), locked_until = null, locked_by = null
             where event_id = $1
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await
        .context("outbox mark_completed failed")?;
        Ok(())
    }

    async fn mark_failed(&self, event_id: Uuid, error: &str, backoff: BackoffPolicy) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.context("outbox mark_failed begin failed")?;
        let (attempts,): (i32,) = sqlx::query_as("select attempts from integration_outbox where event_id = $1 for update")
            .bind(event_id)
            .fetch_one(&mut *tx)
            .await
            .context("outbox mark_failed lookup failed")?;
        let new_attempts = attempts + 1;
        let delay = backoff.delay_for(new_attempts as u32);
        sqlx::query(
            r#"
            update integration_outbox
               set attempts = $2,
                   error_history = error_history || to_jsonb($3::text),
                   last_error = $3,
                   next_attempt_at = now() + make_interval(secs => $4),
                   status = 'pending',
                   locked_until = null,
                   locked_by = null
             where event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(new_attempts)
        .bind(error)
        .bind(delay.as_secs_f64())
        .execute(&mut *tx)
        .await
        .context("outbox mark_failed update failed")?;
        tx.commit().await.context("outbox mark_failed commit failed")?;
        Ok(())
    }

    async fn move_to_dlq(&self, event_id: Uuid) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.context("outbox move_to_dlq begin failed")?;
        let query = format!("select {ENTRY_COLUMNS} from integration_outbox where event_id = $1 for update");
        let row = sqlx::query(&query)
            .bind(event_id)
            .fetch_optional(&mut *tx)
            .await
            .context("outbox move_to_dlq lookup failed")?
            .ok_or_else(|| anyhow::anyhow!("no outbox row for event {event_id}"))?;
        let entry = row_to_entry(row)?;

        sqlx::query(
            r#"
            insert into integration_dlq (event_id, event_type, payload, attempts, final_error, blog_id)
            values ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.event_id)
        .bind(&entry.event_type)
        .bind(&entry.payload)
        .bind(entry.attempts as i32)
        .bind(entry.last_error.clone().unwrap_or_default())
        .bind(entry.blog_id.0)
        .execute(&mut *tx)
        .await
        .context("outbox move_to_dlq insert failed")?;

        sqlx::query("update integration_outbox set status = 'dlq', locked_until = null, locked_by = null where event_id = $1")
            .bind(event_id)
            .execute(&mut *tx)
            .await
            .context("outbox move_to_dlq status update failed")?;

        tx.commit().await.context("outbox move_to_dlq commit failed")?;
        Ok(())
    }

    async fn release_stale_locks(&self, timeout: Duration) -> anyhow::Result<u64> {
        let rows = sqlx::query(
            r#"
            update integration_outbox
               set status = 'pending', locked_until = null, locked_by = null
             where status = 'processing'
               and locked_until < now() - make_interval(secs => $1)
            returning id
            "#,
        )
        .bind(timeout.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .context("outbox release_stale_locks failed")?;
        Ok(rows.len() as u64)
    }

    async fn cancel_duplicates(&self, event_type: &str, _payload_signature: &str) -> anyhow::Result<u64> {
        let rows = sqlx::query(
            r#"
            update integration_outbox
               set status = 'cancelled'
             where event_type = $1
               and is_unique = true
               and status = 'pending'
            returning id
            "#,
        )
        .bind(event_type)
        .fetch_all(&self.pool)
        .await
        .context("outbox cancel_duplicates failed")?;
        Ok(rows.len() as u64)
    }

    async fn get_stats(&self) -> anyhow::Result<OutboxStats> {
        let rows = sqlx::query("select status, count(*)::bigint as n from integration_outbox group by status")
            .fetch_all(&self.pool)
            .await
            .context("outbox get_stats failed")?;
        let mut stats = OutboxStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            let n = n as u64;
            match OutboxStatus::parse(&status)? {
                OutboxStatus::Pending => stats.pending = n,
                OutboxStatus::Processing => stats.processing = n,
                OutboxStatus::Completed => stats.completed = n,
                OutboxStatus::Failed => stats.failed = n,
                OutboxStatus::Dlq => stats.dlq = n,
                OutboxStatus::Cancelled => stats.cancelled = n,
            }
        }
        let (unresolved,): (i64,) = sqlx::query_as("select count(*)::bigint from integration_dlq where resolved_at is null")
            .fetch_one(&self.pool)
            .await
            .context("outbox get_stats dlq count failed")?;
        stats.unresolved_dlq = unresolved as u64;
        Ok(stats)
    }

    async fn purge_completed(&self, days: i64) -> anyhow::Result<u64> {
        let rows = sqlx::query(
            r#"
            delete from integration_outbox
             where status = 'completed'
               and processed_at < now() - make_interval(days => $1)
            returning id
            "#,
        )
        .bind(days as i32)
        .fetch_all(&self.pool)
        .await
        .context("outbox purge_completed failed")?;
        Ok(rows.len() as u64)
    }

    async fn list_dlq(&self) -> anyhow::Result<Vec<DlqEntry>> {
        let rows = sqlx::query(
            "select event_id, event_type, payload, attempts, final_error, moved_at, resolved_at, blog_id from integration_dlq",
        )
        .fetch_all(&self.pool)
        .await
        .context("outbox list_dlq failed")?;
        rows.into_iter()
            .map(|row| {
                Ok(DlqEntry {
                    event_id: row.try_get("event_id")?,
                    event_type: row.try_get("event_type")?,
                    payload: row.try_get("payload")?,
                    attempts: row.try_get::<i32, _>("attempts")? as u32,
                    final_error: row.try_get("final_error")?,
                    moved_at: row.try_get("moved_at")?,
                    resolved_at: row.try_get("resolved_at")?,
                    blog_id: TenantId(row.try_get("blog_id")?),
                })
            })
            .collect()
    }
}
