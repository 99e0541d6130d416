//! Command audit data model (spec.md §3 CommandAudit, used by C12's Audit middleware).
//!
//! Storage of the audit row is an external collaborator (spec.md §1: "request-phase
//! audit log writing" is out of scope — only its taxonomy/interface is specified
//! here). The canonical append-only-log-with-hash-chain *technique* used elsewhere
//! in this workspace's source lineage lives in the teacher's audit writer; a command
//! audit row, by contrast, is a single mutable row keyed by `command_id` (preflight
//! insert, postflight update), so it is modeled as a repository, not a log writer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ddd_schemas::{CommandAuditStatus, CommandSource, TenantId};
use serde_json::Value;
use uuid::Uuid;

/// One row per command (spec.md §3).
#[derive(Debug, Clone)]
pub struct CommandAudit {
    pub command_id: Uuid,
    pub correlation_id: Uuid,
    pub command_name: String,
    pub status: CommandAuditStatus,
    pub source: CommandSource,
    pub source_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub peak_memory_bytes: Option<i64>,
    /// Redacted at the call site before this struct is constructed — this crate
    /// does not know which fields are sensitive for a given command type.
    pub parameters: Value,
    pub events: Vec<String>,
    pub error: Option<CommandAuditError>,
    pub blog_id: TenantId,
}

impl CommandAudit {
    /// The preflight row written before the handler runs.
    pub fn preflight(
        command_id: Uuid,
        correlation_id: Uuid,
        command_name: impl Into<String>,
        source: CommandSource,
        source_id: Option<String>,
        parameters: Value,
        blog_id: TenantId,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            command_id,
            correlation_id,
            command_name: command_name.into(),
            status: CommandAuditStatus::InProgress,
            source,
            source_id,
            started_at,
            finished_at: None,
            duration_ms: None,
            peak_memory_bytes: None,
            parameters,
            events: Vec::new(),
            error: None,
            blog_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandAuditError {
    pub error_type: String,
    pub message: String,
    pub code: Option<String>,
}

/// The postflight update applied once the handler returns or throws.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub status: CommandAuditStatus,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub peak_memory_bytes: Option<i64>,
    pub events: Vec<String>,
    pub error: Option<CommandAuditError>,
}

/// Persistence boundary for [`CommandAudit`] rows. The audit middleware (C12)
/// calls `start` before invoking the handler and `finish` after, regardless of
/// whether the surrounding transaction committed or rolled back — spec.md's
/// design notes call this out explicitly: the audit row must survive a
/// transaction rollback, so it is written outside the command's own transaction.
#[async_trait]
pub trait CommandAuditRepository: Send + Sync {
    async fn start(&self, audit: CommandAudit) -> anyhow::Result<()>;
    async fn finish(&self, command_id: Uuid, outcome: CommandOutcome) -> anyhow::Result<()>;
    async fn find(&self, command_id: Uuid) -> anyhow::Result<Option<CommandAudit>>;
}

/// In-memory repository for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryCommandAuditRepository {
    rows: std::sync::Mutex<std::collections::HashMap<Uuid, CommandAudit>>,
}

impl InMemoryCommandAuditRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommandAuditRepository for InMemoryCommandAuditRepository {
    async fn start(&self, audit: CommandAudit) -> anyhow::Result<()> {
        self.rows.lock().unwrap().insert(audit.command_id, audit);
        Ok(())
    }

    async fn finish(&self, command_id: Uuid, outcome: CommandOutcome) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .get_mut(&command_id)
            .ok_or_else(|| anyhow::anyhow!("no preflight audit row for command {command_id}"))?;
        row.status = outcome.status;
        row.finished_at = Some(outcome.finished_at);
        row.duration_ms = Some(outcome.duration_ms);
        row.peak_memory_bytes = outcome.peak_memory_bytes;
        row.events = outcome.events;
        row.error = outcome.error;
        Ok(())
    }

    async fn find(&self, command_id: Uuid) -> anyhow::Result<Option<CommandAudit>> {
        Ok(self.rows.lock().unwrap().get(&command_id).cloned())
    }
}

impl Clone for CommandAudit {
    fn clone(&self) -> Self {
        Self {
            command_id: self.command_id,
            correlation_id: self.correlation_id,
            command_name: self.command_name.clone(),
            status: self.status,
            source: self.source,
            source_id: self.source_id.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            duration_ms: self.duration_ms,
            peak_memory_bytes: self.peak_memory_bytes,
            parameters: self.parameters.clone(),
            events: self.events.clone(),
            error: self.error.clone(),
            blog_id: self.blog_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finish_updates_preflight_row_in_place() {
        let repo = InMemoryCommandAuditRepository::new();
        let command_id = Uuid::new_v4();
        let started = Utc::now();
        repo.start(CommandAudit::preflight(
            command_id,
            Uuid::new_v4(),
            "PlaceOrder",
            CommandSource::User,
            Some("user-1".into()),
            serde_json::json!({"qty": 3}),
            TenantId(1),
            started,
        ))
        .await
        .unwrap();

        repo.finish(
            command_id,
            CommandOutcome {
                status: CommandAuditStatus::Success,
                finished_at: started + chrono::Duration::milliseconds(40),
                duration_ms: 40,
                peak_memory_bytes: Some(1024),
                events: vec!["OrderPlaced".into()],
                error: None,
            },
        )
        .await
        .unwrap();

        let row = repo.find(command_id).await.unwrap().unwrap();
        assert_eq!(row.status, CommandAuditStatus::Success);
        assert_eq!(row.duration_ms, Some(40));
        assert_eq!(row.events, vec!["OrderPlaced".to_string()]);
    }

    #[tokio::test]
    async fn finish_without_preflight_row_errors() {
        let repo = InMemoryCommandAuditRepository::new();
        let result = repo
            .finish(
                Uuid::new_v4(),
                CommandOutcome {
                    status: CommandAuditStatus::Error,
                    finished_at: Utc::now(),
                    duration_ms: 1,
                    peak_memory_bytes: None,
                    events: vec![],
                    error: None,
                },
            )
            .await;
        assert!(result.is_err());
    }
}
