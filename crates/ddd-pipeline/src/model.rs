//! Command contract and the transaction boundary the pipeline wraps around it
//! (spec.md §4.12, C12).

use async_trait::async_trait;
use ddd_schemas::{CommandSource, TenantId};
use ddd_events::UnitOfWork;
use serde_json::Value;

/// A single write operation submitted to the pipeline.
///
/// `is_transactional` is the "marker trait" spec.md §4.12 describes, expressed
/// as an overridable default rather than a second trait: a command opts out of
/// the transaction middleware by overriding it to `false`, same effect, one
/// trait to implement.
pub trait Command: Send + Sync {
    fn name(&self) -> &'static str;
    fn source(&self) -> CommandSource;
    fn source_id(&self) -> Option<String> {
        None
    }
    /// Redacted before construction — this crate has no notion of which
    /// fields a given command type considers sensitive.
    fn parameters(&self) -> Value;
    fn blog_id(&self) -> TenantId;
    fn is_transactional(&self) -> bool {
        true
    }
}

/// Resolved handler for one concrete command type (spec.md §4.12 step 5).
///
/// Handlers record domain/integration events onto the supplied [`UnitOfWork`]
/// rather than publishing directly; the Publish middleware drains it after
/// the handler returns.
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync {
    type Output: Send;

    async fn handle(&self, command: &C, uow: &mut UnitOfWork) -> anyhow::Result<Self::Output>;
}

/// An open transaction. Commit/rollback are idempotent no-ops once the other
/// has already run, matching how a dropped `sqlx::Transaction` that was never
/// committed rolls back on its own.
#[async_trait]
pub trait Transaction: Send + Sync {
    async fn commit(&self) -> anyhow::Result<()>;
    async fn rollback(&self) -> anyhow::Result<()>;
}

/// Begins the transaction the Transaction middleware wraps around handler
/// execution and event publication (spec.md §4.12 step 3). The default,
/// no-op implementation is for commands/tests that never opt in; the real
/// implementation lives alongside the storage layer (`ddd-db`).
#[async_trait]
pub trait TransactionManager: Send + Sync {
    async fn begin(&self) -> anyhow::Result<Box<dyn Transaction>>;
}

pub struct NoopTransaction;

#[async_trait]
impl Transaction for NoopTransaction {
    async fn commit(&self) -> anyhow::Result<()> {
        Ok(())
    }
    async fn rollback(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A `TransactionManager` for hosts with nothing transactional to guard —
/// every command still flows through the same middleware order, it just
/// never has anything to commit or roll back.
pub struct NoopTransactionManager;

#[async_trait]
impl TransactionManager for NoopTransactionManager {
    async fn begin(&self) -> anyhow::Result<Box<dyn Transaction>> {
        Ok(Box::new(NoopTransaction))
    }
}
