//! Transactional outbox store (spec.md §4.4, C4).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ddd_schemas::{MessageKind, OutboxStatus, TenantId, Transport};
use uuid::Uuid;

/// Row in the outbox table (spec.md §3 OutboxEntry).
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub id: i64,
    pub event_id: Uuid,
    pub event_type: String,
    pub integration_action: String,
    pub message_kind: MessageKind,
    pub transport: Transport,
    pub queue: Option<String>,
    pub payload_bytes: usize,
    pub correlation_id: Uuid,
    pub sequence: u64,
    pub command_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub delay_seconds: i64,
    pub scheduled_at: DateTime<Utc>,
    pub is_unique: bool,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub last_error: Option<String>,
    pub error_history: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub blog_id: TenantId,
}

/// Append-only copy of an outbox entry that exceeded `max_attempts` (spec.md §3).
#[derive(Debug, Clone)]
pub struct DlqEntry {
    pub event_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub final_error: String,
    pub moved_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub blog_id: TenantId,
}

/// Grouped counts by status, plus unresolved DLQ count (`get_stats`).
#[derive(Debug, Clone, Default)]
pub struct OutboxStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dlq: u64,
    pub cancelled: u64,
    pub unresolved_dlq: u64,
}

/// Exponential backoff parameters for `mark_failed` (spec.md §4.4, §6 outbox config).
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
            multiplier: 2.0,
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl BackoffPolicy {
    /// `delay = min(base * multiplier^(attempts-1), max_delay)`, `attempts >= 1`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1) as i32;
        let raw_secs = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

/// Parameters for inserting a new row; mirrors the fields `write` derives
/// from the event/correlation context rather than takes as raw columns.
pub struct NewOutboxEntry {
    pub event_type: String,
    pub integration_action: String,
    pub message_kind: MessageKind,
    pub transport: Transport,
    pub queue: Option<String>,
    pub payload: serde_json::Value,
    pub correlation_id: Uuid,
    pub sequence: u64,
    pub command_id: Option<Uuid>,
    pub delay_seconds: i64,
    pub is_unique: bool,
    pub max_attempts: u32,
    pub blog_id: TenantId,
}

/// Durable event table + DLQ: write/fetch/lock/complete/fail/cancel (spec.md §4.4).
///
/// The production implementation (`ddd-db`) backs this with Postgres
/// `SELECT ... FOR UPDATE SKIP LOCKED`, the same claim idiom the teacher's
/// `outbox_claim_batch` uses. [`InMemoryOutboxStore`] here is a reference
/// implementation satisfying the same contract, used by the processor's own
/// tests and by cross-crate scenario tests.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn write(&self, entry: NewOutboxEntry) -> anyhow::Result<Uuid>;
    async fn fetch_pending(&self, limit: u32, worker_id: &str) -> anyhow::Result<Vec<OutboxEntry>>;
    async fn find_by_event_id(&self, event_id: Uuid) -> anyhow::Result<Option<OutboxEntry>>;
    async fn mark_completed(&self, event_id: Uuid) -> anyhow::Result<()>;
    async fn mark_failed(
        &self,
        event_id: Uuid,
        error: &str,
        backoff: BackoffPolicy,
    ) -> anyhow::Result<()>;
    async fn move_to_dlq(&self, event_id: Uuid) -> anyhow::Result<()>;
    async fn release_stale_locks(&self, timeout: Duration) -> anyhow::Result<u64>;
    async fn cancel_duplicates(
        &self,
        event_type: &str,
        payload_signature: &str,
    ) -> anyhow::Result<u64>;
    async fn get_stats(&self) -> anyhow::Result<OutboxStats>;
    async fn purge_completed(&self, days: i64) -> anyhow::Result<u64>;
    async fn list_dlq(&self) -> anyhow::Result<Vec<DlqEntry>>;
}

#[derive(Default)]
struct MemoryState {
    entries: HashMap<Uuid, OutboxEntry>,
    dlq: Vec<DlqEntry>,
    next_id: i64,
}

/// In-memory [`OutboxStore`] used by tests and single-process demos.
pub struct InMemoryOutboxStore {
    state: Mutex<MemoryState>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
        }
    }
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn write(&self, entry: NewOutboxEntry) -> anyhow::Result<Uuid> {
        let mut state = self.state.lock().unwrap();
        let event_id = Uuid::new_v4();
        let now = Utc::now();
        let payload_bytes = serde_json::to_vec(&entry.payload)?.len();
        state.next_id += 1;
        let row = OutboxEntry {
            id: state.next_id,
            event_id,
            event_type: entry.event_type,
            integration_action: entry.integration_action,
            message_kind: entry.message_kind,
            transport: entry.transport,
            queue: entry.queue,
            payload_bytes,
            correlation_id: entry.correlation_id,
            sequence: entry.sequence,
            command_id: entry.command_id,
            payload: entry.payload,
            delay_seconds: entry.delay_seconds,
            scheduled_at: now + chrono::Duration::seconds(entry.delay_seconds.max(0)),
            is_unique: entry.is_unique,
            status: OutboxStatus::Pending,
            attempts: 0,
            max_attempts: entry.max_attempts,
            next_attempt_at: None,
            locked_until: None,
            locked_by: None,
            last_error: None,
            error_history: Vec::new(),
            created_at: now,
            processed_at: None,
            blog_id: entry.blog_id,
        };
        state.entries.insert(event_id, row);
        Ok(event_id)
    }

    async fn fetch_pending(&self, limit: u32, worker_id: &str) -> anyhow::Result<Vec<OutboxEntry>> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let mut candidates: Vec<Uuid> = state
            .entries
            .values()
            .filter(|e| {
                e.status == OutboxStatus::Pending
                    && e.scheduled_at <= now
                    && e.next_attempt_at.map(|t| t <= now).unwrap_or(true)
                    && e.locked_until.map(|t| t <= now).unwrap_or(true)
            })
            .map(|e| e.event_id)
            .collect();
        candidates.sort_by_key(|id| state.entries[id].scheduled_at);
        candidates.truncate(limit as usize);

        let lock_ttl = chrono::Duration::seconds(300);
        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            let row = state.entries.get_mut(&id).unwrap();
            row.locked_until = Some(now + lock_ttl);
            row.locked_by = Some(worker_id.to_string());
            row.status = OutboxStatus::Processing;
            claimed.push(row.clone());
        }
        Ok(claimed)
    }

    async fn find_by_event_id(&self, event_id: Uuid) -> anyhow::Result<Option<OutboxEntry>> {
        Ok(self.state.lock().unwrap().entries.get(&event_id).cloned())
    }

    async fn mark_completed(&self, event_id: Uuid) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let row = state
            .entries
            .get_mut(&event_id)
            .ok_or_else(|| anyhow::anyhow!("no outbox row for event {event_id}"))?;
        row.status = OutboxStatus::Completed;
        row.processed_at = Some(Utc::now());
        row.locked_until = None;
        row.locked_by = None;
        Ok(())
    }

    async fn mark_failed(
        &self,
        event_id: Uuid,
        error: &str,
        backoff: BackoffPolicy,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let row = state
            .entries
            .get_mut(&event_id)
            .ok_or_else(|| anyhow::anyhow!("no outbox row for event {event_id}"))?;
        row.attempts += 1;
        row.error_history.push(error.to_string());
        row.last_error = Some(error.to_string());
        let delay = backoff.delay_for(row.attempts);
        row.next_attempt_at = Some(Utc::now() + chrono::Duration::from_std(delay)?);
        row.status = OutboxStatus::Pending;
        row.locked_until = None;
        row.locked_by = None;
        Ok(())
    }

    async fn move_to_dlq(&self, event_id: Uuid) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let row = state
            .entries
            .get_mut(&event_id)
            .ok_or_else(|| anyhow::anyhow!("no outbox row for event {event_id}"))?;
        let dlq_row = DlqEntry {
            event_id: row.event_id,
            event_type: row.event_type.clone(),
            payload: row.payload.clone(),
            attempts: row.attempts,
            final_error: row.last_error.clone().unwrap_or_default(),
            moved_at: Utc::now(),
            resolved_at: None,
            blog_id: row.blog_id,
        };
        row.status = OutboxStatus::Dlq;
        row.locked_until = None;
        row.locked_by = None;
        state.dlq.push(dlq_row);
        Ok(())
    }

    async fn release_stale_locks(&self, timeout: Duration) -> anyhow::Result<u64> {
        let mut state = self.state.lock().unwrap();
        let cutoff = Utc::now() - chrono::Duration::from_std(timeout)?;
        let mut count = 0u64;
        for row in state.entries.values_mut() {
            if row.status == OutboxStatus::Processing {
                if let Some(locked_until) = row.locked_until {
                    if locked_until < cutoff {
                        row.status = OutboxStatus::Pending;
                        row.locked_until = None;
                        row.locked_by = None;
                        count += 1;
                    }
                }
            }
        }
        Ok(count)
    }

    async fn cancel_duplicates(
        &self,
        event_type: &str,
        _payload_signature: &str,
    ) -> anyhow::Result<u64> {
        let mut state = self.state.lock().unwrap();
        let mut count = 0u64;
        for row in state.entries.values_mut() {
            if row.event_type == event_type
                && row.is_unique
                && row.status == OutboxStatus::Pending
            {
                row.status = OutboxStatus::Cancelled;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn get_stats(&self) -> anyhow::Result<OutboxStats> {
        let state = self.state.lock().unwrap();
        let mut stats = OutboxStats::default();
        for row in state.entries.values() {
            match row.status {
                OutboxStatus::Pending => stats.pending += 1,
                OutboxStatus::Processing => stats.processing += 1,
                OutboxStatus::Completed => stats.completed += 1,
                OutboxStatus::Failed => stats.failed += 1,
                OutboxStatus::Dlq => stats.dlq += 1,
                OutboxStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats.unresolved_dlq = state.dlq.iter().filter(|d| d.resolved_at.is_none()).count() as u64;
        Ok(stats)
    }

    async fn purge_completed(&self, days: i64) -> anyhow::Result<u64> {
        let mut state = self.state.lock().unwrap();
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let to_remove: Vec<Uuid> = state
            .entries
            .values()
            .filter(|e| e.status == OutboxStatus::Completed && e.processed_at.map(|t| t < cutoff).unwrap_or(false))
            .map(|e| e.event_id)
            .collect();
        let count = to_remove.len() as u64;
        for id in to_remove {
            state.entries.remove(&id);
        }
        Ok(count)
    }

    async fn list_dlq(&self) -> anyhow::Result<Vec<DlqEntry>> {
        Ok(self.state.lock().unwrap().dlq.clone())
    }
}
