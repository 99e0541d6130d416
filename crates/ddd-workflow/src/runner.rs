//! Behaviour workflow runner (spec.md §4.11, C11).

use std::collections::HashMap;
use std::sync::Arc;

use ddd_schemas::{BehaviourExecutionStatus, ResourceBudget, Tagged, WorkItemStatus};

use crate::model::{
    BehaviourConfigHandler, BehaviourExecutionResult, BehaviourWorkflow, WorkItem, WorkItemRepository,
    WorkflowRepository, WorkflowScheduler,
};

#[derive(Debug)]
pub enum WorkflowError {
    UnknownConfigKind(String),
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownConfigKind(kind) => write!(f, "no behaviour config handler registered for '{kind}'"),
        }
    }
}

impl std::error::Error for WorkflowError {}

/// Host-specific memory sampler, mirroring the long-process runner's: the
/// default reports no pressure, degrading the budget to a pure wall-clock check.
pub trait MemorySampler: Send + Sync {
    fn current_fraction(&self) -> f64 {
        0.0
    }
}

pub struct NoMemorySampler;
impl MemorySampler for NoMemorySampler {}

fn map_aggregate(agg: WorkItemStatus) -> BehaviourExecutionStatus {
    match agg {
        WorkItemStatus::Pending => BehaviourExecutionStatus::Batched,
        WorkItemStatus::Waiting => BehaviourExecutionStatus::Waiting,
        WorkItemStatus::Failed => BehaviourExecutionStatus::Failed,
        WorkItemStatus::Done | WorkItemStatus::Skipped => BehaviourExecutionStatus::Completed,
    }
}

pub struct BehaviourWorkflowRunner {
    workflows: Arc<dyn WorkflowRepository>,
    items: Arc<dyn WorkItemRepository>,
    handlers: HashMap<String, Arc<dyn BehaviourConfigHandler>>,
    scheduler: Arc<dyn WorkflowScheduler>,
    memory: Arc<dyn MemorySampler>,
    max_retries: u32,
    max_execution_seconds: u64,
    memory_limit_percent: f64,
    reschedule_interval_seconds: u64,
    fork_delay_seconds: u64,
}

impl BehaviourWorkflowRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workflows: Arc<dyn WorkflowRepository>,
        items: Arc<dyn WorkItemRepository>,
        handlers: Vec<Arc<dyn BehaviourConfigHandler>>,
        scheduler: Arc<dyn WorkflowScheduler>,
        max_retries: u32,
        reschedule_interval_seconds: u64,
        fork_delay_seconds: u64,
    ) -> Self {
        Self::with_budget(
            workflows,
            items,
            handlers,
            scheduler,
            max_retries,
            reschedule_interval_seconds,
            fork_delay_seconds,
            25,
            0.8,
            Arc::new(NoMemorySampler),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_budget(
        workflows: Arc<dyn WorkflowRepository>,
        items: Arc<dyn WorkItemRepository>,
        handlers: Vec<Arc<dyn BehaviourConfigHandler>>,
        scheduler: Arc<dyn WorkflowScheduler>,
        max_retries: u32,
        reschedule_interval_seconds: u64,
        fork_delay_seconds: u64,
        max_execution_seconds: u64,
        memory_limit_percent: f64,
        memory: Arc<dyn MemorySampler>,
    ) -> Self {
        let handlers = handlers.into_iter().map(|h| (h.kind().to_string(), h)).collect();
        Self {
            workflows,
            items,
            handlers,
            scheduler,
            memory,
            max_retries,
            max_execution_seconds,
            memory_limit_percent,
            reschedule_interval_seconds,
            fork_delay_seconds,
        }
    }

    fn handler_for(&self, config: &Tagged) -> Result<Arc<dyn BehaviourConfigHandler>, WorkflowError> {
        self.handlers
            .get(&config.class)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownConfigKind(config.class.clone()))
    }

    /// One command may produce several workflows (spec.md §4.11): the first
    /// runs inline, the rest are fanned out via an immediate (zero-delay) reschedule.
    pub async fn run_for_command(&self, mut workflows: Vec<BehaviourWorkflow>) -> anyhow::Result<()> {
        let mut iter = workflows.drain(..);
        if let Some(mut first) = iter.next() {
            self.run_workflow(&mut first).await?;
        }
        for mut secondary in iter {
            let id = self.workflows.save(&mut secondary).await?;
            self.scheduler.reschedule(id, 0).await?;
        }
        Ok(())
    }

    pub async fn run_workflow(&self, workflow: &mut BehaviourWorkflow) -> anyhow::Result<()> {
        if workflow.id.is_none() {
            let id = self.workflows.save(workflow).await?;
            workflow.id = Some(id);
        }
        let workflow_id = workflow.id.expect("just assigned");
        let budget = ResourceBudget::new(self.max_execution_seconds, self.memory_limit_percent);

        while !workflow.is_terminal() {
            let Some(config) = workflow.get_current().cloned() else {
                break;
            };
            let handler = self.handler_for(&config)?;
            let saga_phases = handler.saga_phases(&config.data);
            let previous = workflow.get_current_result().cloned();

            self.ensure_work_items(workflow, &config, handler.as_ref()).await?;
            let items = self
                .items
                .get_for_step(workflow_id, workflow.current_idx, workflow.current_phase)
                .await?;

            let result = self
                .execute_with_ledger(workflow, &config, handler.as_ref(), &items, previous.as_ref(), &budget)
                .await?;

            let augmented = workflow.maybe_advance(result, saga_phases);
            self.workflows.save(workflow).await?;
            let budget_exceeded = budget.exceeded(self.memory.current_fraction());

            match augmented.status {
                BehaviourExecutionStatus::Waiting => {
                    tracing::info!(workflow_id, "behaviour workflow suspended awaiting external signal");
                    break;
                }
                BehaviourExecutionStatus::Batched => {
                    self.scheduler.reschedule(workflow_id, self.reschedule_interval_seconds).await?;
                    break;
                }
                BehaviourExecutionStatus::Failed => {
                    if augmented.failure_count() as u32 <= self.max_retries {
                        self.scheduler.reschedule(workflow_id, self.reschedule_interval_seconds).await?;
                    } else {
                        workflow.is_failed = true;
                        self.workflows.save(workflow).await?;
                    }
                    break;
                }
                _ => {
                    if budget_exceeded {
                        self.scheduler.reschedule(workflow_id, self.reschedule_interval_seconds).await?;
                        break;
                    }
                }
            }
        }

        self.workflows.save(workflow).await?;
        Ok(())
    }

    async fn ensure_work_items(
        &self,
        workflow: &BehaviourWorkflow,
        config: &Tagged,
        handler: &dyn BehaviourConfigHandler,
    ) -> anyhow::Result<()> {
        let workflow_id = workflow.id.expect("workflow persisted before ensure_work_items");
        let existing = self
            .items
            .get_for_step(workflow_id, workflow.current_idx, workflow.current_phase)
            .await?;
        if !existing.is_empty() {
            return Ok(());
        }
        let generated = handler.generate_work_items(workflow, &config.data).await?;
        for new_item in generated {
            let mut item = WorkItem::new(
                workflow_id,
                workflow.current_idx,
                workflow.current_phase,
                new_item.item_key,
                new_item.payload,
                workflow.blog_id,
            );
            self.items.save(&mut item).await?;
        }
        Ok(())
    }

    async fn execute_with_ledger(
        &self,
        workflow: &mut BehaviourWorkflow,
        config: &Tagged,
        handler: &dyn BehaviourConfigHandler,
        items: &crate::model::WorkItemList,
        previous: Option<&BehaviourExecutionResult>,
        budget: &ResourceBudget,
    ) -> anyhow::Result<BehaviourExecutionResult> {
        let batch_size = if handler.is_batchable(&config.data) {
            handler.default_batch_size(&config.data)
        } else {
            1
        };

        let mut batch_success = 0u32;
        let mut batch_error: Option<String> = None;
        let mut item_failed = false;

        let pending = items.pending().take(batch_size).into_vec();
        for mut item in pending {
            let outcome = handler.execute_one(&config.data, &item, previous).await;
            let result = match outcome {
                Ok(result) => result,
                Err(err) => BehaviourExecutionResult::new(
                    config.class.clone(),
                    BehaviourExecutionStatus::Failed,
                    workflow.current_phase,
                )
                .with_batch_audit(0, Some(err.to_string())),
            };
            item.apply_result(&result);
            self.items.save(&mut item).await?;

            if result.success {
                batch_success += 1;
            } else if let Some(err) = &result.batch_error {
                batch_error = Some(err.clone());
            }

            match result.status {
                BehaviourExecutionStatus::Waiting => {
                    return Ok(result.with_batch_audit(batch_success, batch_error));
                }
                BehaviourExecutionStatus::Failed => {
                    item_failed = true;
                    break;
                }
                _ => {}
            }

            if budget.exceeded(self.memory.current_fraction()) {
                return Ok(BehaviourExecutionResult::new(
                    config.class.clone(),
                    BehaviourExecutionStatus::Batched,
                    workflow.current_phase,
                )
                .with_batch_audit(batch_success, batch_error));
            }
        }

        let workflow_id = workflow.id.expect("workflow persisted");
        let refreshed = self
            .items
            .get_for_step(workflow_id, workflow.current_idx, workflow.current_phase)
            .await?;
        let mapped = if item_failed {
            BehaviourExecutionStatus::Failed
        } else {
            map_aggregate(refreshed.aggregate_status())
        };

        if mapped == BehaviourExecutionStatus::Failed {
            // Retries are exhausted once the previously stored result (if
            // any) already recorded `max_retries` failures; only then does a
            // batchable, non-fork workflow spin off its failed items instead
            // of retrying the whole step again (spec.md §4.11.1, §4.11.2).
            let prior_failures = previous.map(|p| p.failure_count()).unwrap_or(0);
            let retries_exhausted = prior_failures >= self.max_retries as usize;
            if retries_exhausted && handler.is_batchable(&config.data) && !workflow.is_fork() {
                let failed_items = refreshed.failed().into_vec();
                if !failed_items.is_empty() {
                    self.fork_child(workflow, config, failed_items).await?;
                    return Ok(BehaviourExecutionResult::new(
                        config.class.clone(),
                        BehaviourExecutionStatus::Forked,
                        workflow.current_phase,
                    )
                    .with_batch_audit(batch_success, batch_error));
                }
            }
        }

        Ok(
            BehaviourExecutionResult::new(config.class.clone(), mapped, workflow.current_phase)
                .with_batch_audit(batch_success, batch_error),
        )
    }

    async fn fork_child(
        &self,
        parent: &BehaviourWorkflow,
        config: &Tagged,
        mut failed_items: Vec<WorkItem>,
    ) -> anyhow::Result<i64> {
        let mut child = BehaviourWorkflow::new(
            parent.ref_id.clone(),
            parent.ref_type.clone(),
            vec![config.clone()],
            parent.meta.clone(),
            parent.blog_id,
        );
        child.root_workflow_id = parent.id;
        let child_id = self.workflows.save(&mut child).await?;

        for item in failed_items.iter_mut() {
            item.transfer_to(child_id, 0);
            self.items.save(item).await?;
        }

        self.scheduler.reschedule(child_id, self.fork_delay_seconds).await?;
        tracing::info!(
            parent_id = parent.id,
            child_id,
            transferred = failed_items.len(),
            "forked failed work items into child workflow"
        );
        Ok(child_id)
    }
}
