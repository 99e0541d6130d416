//! BehaviourWorkflow aggregate, BehaviourExecutionResult, and the work-item
//! ledger entity (spec.md §3, §4.9–§4.10, C9/C10).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ddd_schemas::{BehaviourExecutionStatus, Tagged, TenantId, WorkItemStatus};
use serde::{Deserialize, Serialize};

/// One behaviour's outcome for one pass of the runner (spec.md §3).
/// Immutable: advancing to a new result is done through [`follow_up`](Self::follow_up),
/// never by mutating a stored value in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviourExecutionResult {
    #[serde(rename = "type")]
    pub kind: String,
    pub success: bool,
    pub context: HashMap<String, serde_json::Value>,
    pub status: BehaviourExecutionStatus,
    pub timestamp: DateTime<Utc>,
    pub phase: u32,
    /// Prior results, most recent first. Entries here never carry their own
    /// nested history — flattened on construction to keep the chain bounded.
    pub history: Vec<BehaviourExecutionResult>,
    pub batch_success: u32,
    pub batch_error: Option<String>,
}

impl BehaviourExecutionResult {
    pub fn new(kind: impl Into<String>, status: BehaviourExecutionStatus, phase: u32) -> Self {
        Self {
            kind: kind.into(),
            success: matches!(
                status,
                BehaviourExecutionStatus::Completed | BehaviourExecutionStatus::Forked | BehaviourExecutionStatus::Preempted
            ),
            context: HashMap::new(),
            status,
            timestamp: Utc::now(),
            phase,
            history: Vec::new(),
            batch_success: 0,
            batch_error: None,
        }
    }

    pub fn with_batch_audit(mut self, batch_success: u32, batch_error: Option<String>) -> Self {
        self.batch_success = batch_success;
        self.batch_error = batch_error;
        self
    }

    /// `r`'s fields become the new result, with history prepended by a
    /// (non-nested) copy of `self`.
    pub fn follow_up(&self, r: BehaviourExecutionResult) -> BehaviourExecutionResult {
        let mut prior = self.clone();
        prior.history.clear();
        let mut history = vec![prior];
        history.extend(self.history.clone());
        BehaviourExecutionResult { history, ..r }
    }

    /// Count of `failed` entries in this result's own history plus itself,
    /// used by the retry budget (spec.md §4.11.2).
    pub fn failure_count(&self) -> usize {
        let mut count = usize::from(self.status == BehaviourExecutionStatus::Failed);
        count += self
            .history
            .iter()
            .filter(|r| r.status == BehaviourExecutionStatus::Failed)
            .count();
        count
    }
}

/// BehaviourWorkflow aggregate (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviourWorkflow {
    pub id: Option<i64>,
    pub ref_id: String,
    pub ref_type: String,
    pub root_workflow_id: Option<i64>,
    pub behaviour_configs: Vec<Tagged>,
    /// Parallel to `behaviour_configs`; `None` until that behaviour has run.
    pub behaviour_results: Vec<Option<BehaviourExecutionResult>>,
    pub current_idx: usize,
    pub current_phase: u32,
    pub is_complete: bool,
    pub is_failed: bool,
    pub meta: HashMap<String, serde_json::Value>,
    pub blog_id: TenantId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BehaviourWorkflow {
    pub fn new(
        ref_id: impl Into<String>,
        ref_type: impl Into<String>,
        behaviour_configs: Vec<Tagged>,
        meta: HashMap<String, serde_json::Value>,
        blog_id: TenantId,
    ) -> Self {
        let now = Utc::now();
        let behaviour_results = vec![None; behaviour_configs.len()];
        Self {
            id: None,
            ref_id: ref_id.into(),
            ref_type: ref_type.into(),
            root_workflow_id: None,
            behaviour_configs,
            behaviour_results,
            current_idx: 0,
            current_phase: 1,
            is_complete: false,
            is_failed: false,
            meta,
            blog_id,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_fork(&self) -> bool {
        self.root_workflow_id.is_some()
    }

    pub fn is_terminal(&self) -> bool {
        self.is_complete || self.is_failed
    }

    pub fn get_current(&self) -> Option<&Tagged> {
        self.behaviour_configs.get(self.current_idx)
    }

    pub fn get_current_result(&self) -> Option<&BehaviourExecutionResult> {
        self.behaviour_results.get(self.current_idx).and_then(|r| r.as_ref())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// spec.md §4.9 `maybe_advance`. `saga_phases` is `Some(n)` when the
    /// current config is a saga behaviour with `n` phases, `None` otherwise.
    /// Returns the stored (history-augmented) result so the caller can apply
    /// the retry budget (spec.md §4.11.2) without recomputing the chain.
    pub fn maybe_advance(
        &mut self,
        result_in: BehaviourExecutionResult,
        saga_phases: Option<u32>,
    ) -> BehaviourExecutionResult {
        let idx = self.current_idx;
        let result = match self.behaviour_results.get(idx).and_then(|r| r.as_ref()) {
            Some(prev) => prev.follow_up(result_in),
            None => result_in,
        };
        let status = result.status;
        if idx < self.behaviour_results.len() {
            self.behaviour_results[idx] = Some(result.clone());
        }

        if status != BehaviourExecutionStatus::Failed {
            if let Some(no_phases) = saga_phases {
                if status == BehaviourExecutionStatus::Cancelled {
                    self.current_idx += 1;
                    self.current_phase = 1;
                } else {
                    self.current_phase += 1;
                    if self.current_phase > no_phases {
                        self.current_idx += 1;
                        self.current_phase = 1;
                    }
                }
            } else if status != BehaviourExecutionStatus::Batched {
                self.current_idx += 1;
            }
        }

        if self.current_idx == self.behaviour_configs.len() {
            self.is_complete = true;
        }
        self.touch();
        result
    }
}

/// Ledger row (spec.md §3 WorkItem).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Option<i64>,
    pub workflow_id: i64,
    pub behaviour_idx: usize,
    pub phase: u32,
    pub item_key: String,
    pub status: WorkItemStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub payload: Option<Tagged>,
    pub blog_id: TenantId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(
        workflow_id: i64,
        behaviour_idx: usize,
        phase: u32,
        item_key: impl Into<String>,
        payload: Option<Tagged>,
        blog_id: TenantId,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            workflow_id,
            behaviour_idx,
            phase,
            item_key: item_key.into(),
            status: WorkItemStatus::Pending,
            attempts: 0,
            last_error: None,
            payload,
            blog_id,
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Mapping `BehaviourExecutionResult → WorkItemStatus` (spec.md §4.11):
    /// `completed → done`, `waiting → waiting`,
    /// `skipped|cancelled|preempted → skipped`, `failed → failed`,
    /// otherwise `success? done : failed`.
    pub fn apply_result(&mut self, result: &BehaviourExecutionResult) {
        self.attempts += 1;
        self.status = match result.status {
            BehaviourExecutionStatus::Completed => WorkItemStatus::Done,
            BehaviourExecutionStatus::Waiting => WorkItemStatus::Waiting,
            BehaviourExecutionStatus::Skipped
            | BehaviourExecutionStatus::Cancelled
            | BehaviourExecutionStatus::Preempted => WorkItemStatus::Skipped,
            BehaviourExecutionStatus::Failed => WorkItemStatus::Failed,
            _ => {
                if result.success {
                    WorkItemStatus::Done
                } else {
                    WorkItemStatus::Failed
                }
            }
        };
        self.last_error = if self.status == WorkItemStatus::Failed {
            result.batch_error.clone()
        } else {
            None
        };
        self.touch();
    }

    /// Transfer this item's identity to a forked child workflow (spec.md
    /// §4.11.1): same row, new owner, reset progress.
    pub fn transfer_to(&mut self, new_workflow_id: i64, new_behaviour_idx: usize) {
        self.workflow_id = new_workflow_id;
        self.behaviour_idx = new_behaviour_idx;
        self.status = WorkItemStatus::Pending;
        self.attempts = 0;
        self.last_error = None;
        self.touch();
    }
}

/// What a config's `generate_work_items` hands back before persistence
/// stamps identity and tenant onto it.
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub item_key: String,
    pub payload: Option<Tagged>,
}

/// A read-only view over one step's ledger rows (spec.md §4.10).
#[derive(Debug, Clone, Default)]
pub struct WorkItemList(Vec<WorkItem>);

impl WorkItemList {
    pub fn new(items: Vec<WorkItem>) -> Self {
        Self(items)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn all(&self) -> &[WorkItem] {
        &self.0
    }

    fn filtered(&self, status: WorkItemStatus) -> WorkItemList {
        WorkItemList(self.0.iter().filter(|i| i.status == status).cloned().collect())
    }

    pub fn pending(&self) -> WorkItemList {
        self.filtered(WorkItemStatus::Pending)
    }

    pub fn waiting(&self) -> WorkItemList {
        self.filtered(WorkItemStatus::Waiting)
    }

    pub fn failed(&self) -> WorkItemList {
        self.filtered(WorkItemStatus::Failed)
    }

    pub fn done(&self) -> WorkItemList {
        self.filtered(WorkItemStatus::Done)
    }

    pub fn take(&self, n: usize) -> WorkItemList {
        WorkItemList(self.0.iter().take(n).cloned().collect())
    }

    /// Priority `pending > waiting > failed > done` (spec.md §4.10). An empty
    /// or all-skipped list aggregates as `done`.
    pub fn aggregate_status(&self) -> WorkItemStatus {
        if self.0.iter().any(|i| i.status == WorkItemStatus::Pending) {
            WorkItemStatus::Pending
        } else if self.0.iter().any(|i| i.status == WorkItemStatus::Waiting) {
            WorkItemStatus::Waiting
        } else if self.0.iter().any(|i| i.status == WorkItemStatus::Failed) {
            WorkItemStatus::Failed
        } else {
            WorkItemStatus::Done
        }
    }

    pub fn into_vec(self) -> Vec<WorkItem> {
        self.0
    }
}

/// spec.md §6 "Workflow repository".
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn get_by_id(&self, id: i64) -> anyhow::Result<Option<BehaviourWorkflow>>;
    async fn get_by_ref_id(&self, ref_id: &str, ref_type: &str) -> anyhow::Result<Option<BehaviourWorkflow>>;
    async fn save(&self, workflow: &mut BehaviourWorkflow) -> anyhow::Result<i64>;
}

/// spec.md §4.10 "Work-item repository".
#[async_trait]
pub trait WorkItemRepository: Send + Sync {
    async fn get_by_id(&self, id: i64) -> anyhow::Result<Option<WorkItem>>;
    async fn find_by_unique(
        &self,
        workflow_id: i64,
        behaviour_idx: usize,
        phase: u32,
        item_key: &str,
    ) -> anyhow::Result<Option<WorkItem>>;
    async fn get_for_step(&self, workflow_id: i64, behaviour_idx: usize, phase: u32) -> anyhow::Result<WorkItemList>;
    /// Insert-if-new-or-update-by-unique-key: idempotent on `(workflow_id, behaviour_idx, phase, item_key)`.
    async fn save(&self, item: &mut WorkItem) -> anyhow::Result<i64>;
}

/// Declares how one behaviour-config kind generates and executes its items.
/// Configs are stored polymorphically as [`Tagged`] envelopes; the runner
/// resolves the handler by `Tagged.class`, the same explicit-registration
/// approach the long-process runner uses to resolve `process_class` —
/// standing in for reflection on a statically typed target.
#[async_trait]
pub trait BehaviourConfigHandler: Send + Sync {
    fn kind(&self) -> &'static str;

    fn is_batchable(&self, _config: &serde_json::Value) -> bool {
        false
    }

    fn default_batch_size(&self, _config: &serde_json::Value) -> usize {
        1
    }

    /// `Some(n)` if this config is an `ISagaBehaviour` with `n` phases.
    fn saga_phases(&self, _config: &serde_json::Value) -> Option<u32> {
        None
    }

    /// Must be deterministic: the runner relies on re-invocations producing
    /// the same keys so `ensure_work_items` stays idempotent (spec.md R2).
    async fn generate_work_items(
        &self,
        workflow: &BehaviourWorkflow,
        config: &serde_json::Value,
    ) -> anyhow::Result<Vec<NewWorkItem>>;

    async fn execute_one(
        &self,
        config: &serde_json::Value,
        item: &WorkItem,
        previous: Option<&BehaviourExecutionResult>,
    ) -> anyhow::Result<BehaviourExecutionResult>;
}

/// Reschedules a workflow for another pass (spec.md §4.11 step 3, §4.11.1).
#[async_trait]
pub trait WorkflowScheduler: Send + Sync {
    async fn reschedule(&self, workflow_id: i64, delay_seconds: u64) -> anyhow::Result<()>;
}
