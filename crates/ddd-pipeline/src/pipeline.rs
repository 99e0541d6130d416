//! The command pipeline: Audit, Correlation, Transaction, Publish, Dispatch,
//! run outside-in around a handler in that fixed order (spec.md §4.12).

use std::sync::Arc;

use chrono::Utc;
use ddd_audit::{CommandAudit, CommandAuditError, CommandAuditRepository, CommandOutcome};
use ddd_correlation::CorrelationContext;
use ddd_events::{EventRouter, UnitOfWork};
use ddd_schemas::CommandAuditStatus;
use uuid::Uuid;

use crate::model::{Command, CommandHandler, TransactionManager};

pub struct CommandPipeline {
    audit: Arc<dyn CommandAuditRepository>,
    tx_manager: Arc<dyn TransactionManager>,
    router: Arc<EventRouter>,
}

impl CommandPipeline {
    pub fn new(
        audit: Arc<dyn CommandAuditRepository>,
        tx_manager: Arc<dyn TransactionManager>,
        router: Arc<EventRouter>,
    ) -> Self {
        Self { audit, tx_manager, router }
    }

    /// Run `command` through the fixed middleware order. `handler` is the
    /// already-resolved handler for `C` (resolving a handler from the
    /// command's own type is the host command bus's job, outside this crate).
    pub async fn handle<C, H>(&self, command: C, handler: &H) -> anyhow::Result<H::Output>
    where
        C: Command,
        H: CommandHandler<C>,
    {
        // 1. Audit (outermost): command_id exists before correlation is
        // touched, and the final row is written even if the transaction
        // below rolls back (spec.md §9).
        let command_id = Uuid::new_v4();
        let correlation_id = ddd_correlation::try_with_current(|c| c.get()).unwrap_or_else(Uuid::new_v4);
        let started_at = Utc::now();
        self.audit
            .start(CommandAudit::preflight(
                command_id,
                correlation_id,
                command.name(),
                command.source(),
                command.source_id(),
                command.parameters(),
                command.blog_id(),
                started_at,
            ))
            .await?;

        let result = self.run_correlated(command_id, correlation_id, &command, handler).await;

        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds();
        let outcome = match &result {
            Ok((_, uow)) => CommandOutcome {
                status: CommandAuditStatus::Success,
                finished_at,
                duration_ms,
                peak_memory_bytes: None,
                events: uow.published().to_vec(),
                error: None,
            },
            Err(err) => CommandOutcome {
                status: CommandAuditStatus::Error,
                finished_at,
                duration_ms,
                peak_memory_bytes: None,
                events: Vec::new(),
                error: Some(CommandAuditError {
                    error_type: "CommandError".to_string(),
                    message: format!("{err:#}"),
                    code: None,
                }),
            },
        };
        self.audit.finish(command_id, outcome).await?;

        result.map(|(output, _)| output)
    }

    // 2. Correlation: reuse an already-ambient correlation id if this command
    // was issued from inside another scope (e.g. a process step dispatching a
    // command), otherwise mint one. `reset()` always runs on exit, via the
    // guard, so nothing leaks to whatever the task runs next.
    async fn run_correlated<C, H>(
        &self,
        command_id: Uuid,
        correlation_id: Uuid,
        command: &C,
        handler: &H,
    ) -> anyhow::Result<(H::Output, UnitOfWork)>
    where
        C: Command,
        H: CommandHandler<C>,
    {
        let ctx = CorrelationContext::with_id(correlation_id);
        ctx.set_command_id(command_id);

        ddd_correlation::scope(ctx, async {
            let _reset_on_exit = CorrelationResetGuard;
            // A second handle on the same correlation id, owned locally so it
            // can be threaded explicitly to the publish step below -
            // `CorrelationContext` is intentionally not `Clone` (see its
            // doc comment), and the task-local one can't be borrowed back out
            // of `with_current`'s closure.
            let publish_ctx = CorrelationContext::with_id(correlation_id);
            self.run_transactional(command, handler, &publish_ctx).await
        })
        .await
    }

    // 3 wraps 4: start a transaction (no-op if the command opts out), commit
    // on success, roll back and re-throw on any error.
    async fn run_transactional<C, H>(
        &self,
        command: &C,
        handler: &H,
        ctx: &CorrelationContext,
    ) -> anyhow::Result<(H::Output, UnitOfWork)>
    where
        C: Command,
        H: CommandHandler<C>,
    {
        if !command.is_transactional() {
            return self.run_handler_and_publish(command, handler, ctx).await;
        }

        let tx = self.tx_manager.begin().await?;
        match self.run_handler_and_publish(command, handler, ctx).await {
            Ok(result) => {
                tx.commit().await?;
                Ok(result)
            }
            Err(err) => {
                tx.rollback().await?;
                Err(err)
            }
        }
    }

    // 4. Publish: reset the unit of work, run the handler (5: dispatch),
    // then drain and route whatever it recorded.
    async fn run_handler_and_publish<C, H>(
        &self,
        command: &C,
        handler: &H,
        ctx: &CorrelationContext,
    ) -> anyhow::Result<(H::Output, UnitOfWork)>
    where
        C: Command,
        H: CommandHandler<C>,
    {
        let mut uow = UnitOfWork::new();
        uow.reset();

        let output = handler.handle(command, &mut uow).await?;

        for event in uow.drain() {
            self.router.publish_erased(event.as_ref(), ctx).await?;
        }

        Ok((output, uow))
    }
}

struct CorrelationResetGuard;

impl Drop for CorrelationResetGuard {
    fn drop(&mut self) {
        let _ = ddd_correlation::try_with_current(|c| c.reset());
    }
}
