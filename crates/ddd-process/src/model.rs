//! LongProcess entity, its repository, and the step-execution contract (spec.md §3, §4.7–§4.8).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ddd_schemas::{ProcessStatus, Tagged, TenantId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::steps::ProcessSteps;

/// Persisted long-running workflow instance (spec.md §3 LongProcess).
#[derive(Debug, Clone)]
pub struct LongProcess {
    pub id: Option<i64>,
    pub process_class: String,
    pub business_data: serde_json::Value,
    pub steps: ProcessSteps,
    pub step_name: String,
    pub status: ProcessStatus,
    pub waiting_for: Option<String>,
    pub match_criteria: Option<serde_json::Value>,
    pub payload: Option<Tagged>,
    pub correlation_id: Uuid,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub blog_id: TenantId,
}

impl LongProcess {
    pub fn start(
        process_class: impl Into<String>,
        business_data: serde_json::Value,
        steps: ProcessSteps,
        correlation_id: Uuid,
        blog_id: TenantId,
    ) -> Self {
        let now = Utc::now();
        let step_name = steps.current_step().unwrap_or_default().to_string();
        Self {
            id: None,
            process_class: process_class.into(),
            business_data,
            steps,
            step_name,
            status: ProcessStatus::Pending,
            waiting_for: None,
            match_criteria: None,
            payload: None,
            correlation_id,
            last_error: None,
            created_at: now,
            updated_at: now,
            blog_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub(crate) fn set_running(&mut self, payload: Option<Tagged>) {
        self.status = ProcessStatus::Running;
        self.payload = payload;
        self.waiting_for = None;
        self.match_criteria = None;
        self.step_name = self.steps.current_step().unwrap_or_default().to_string();
        self.touch();
    }

    pub(crate) fn set_suspended(&mut self, waiting_for: String, match_criteria: serde_json::Value, payload: Option<Tagged>) {
        self.status = ProcessStatus::Suspended;
        self.waiting_for = Some(waiting_for);
        self.match_criteria = Some(match_criteria);
        self.payload = payload;
        self.touch();
    }

    pub(crate) fn set_scheduled(&mut self) {
        self.status = ProcessStatus::Scheduled;
        self.touch();
    }

    pub(crate) fn set_completed(&mut self) {
        self.status = ProcessStatus::Completed;
        self.touch();
    }

    pub(crate) fn set_failed(&mut self, message: impl Into<String>) {
        self.status = ProcessStatus::Failed;
        self.last_error = Some(message.into());
        self.touch();
    }
}

/// `save`/`find`/`find_waiting_for`/`delete` (spec.md §6 "Process repository").
#[async_trait]
pub trait ProcessRepository: Send + Sync {
    async fn save(&self, process: &mut LongProcess) -> anyhow::Result<i64>;
    async fn find(&self, id: i64) -> anyhow::Result<Option<LongProcess>>;
    /// Only processes currently `status = suspended` (spec.md §6).
    async fn find_waiting_for(&self, event_class: &str) -> anyhow::Result<Vec<LongProcess>>;
    async fn delete(&self, id: i64) -> anyhow::Result<()>;
}

/// A step's request to suspend until a matching integration event arrives (spec.md §4.8.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwaitEvent {
    pub event_class: String,
    /// Strict equality on event fields (spec.md §4.8.4).
    pub match_criteria: serde_json::Value,
}

/// A step's output (spec.md §4.8.1).
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub payload: Option<Tagged>,
    /// Fire-and-forget side effects; each carries its own correlation
    /// propagation and is dispatched immediately by the runner. Modeled as
    /// opaque envelopes since the command bus itself is an external
    /// collaborator (spec.md §1).
    pub commands: Vec<serde_json::Value>,
    pub await_event: Option<AwaitEvent>,
    pub checkpoint: Option<Tagged>,
}

/// Dispatches the fire-and-forget commands a step result carries. The
/// command bus's own dispatch/handler-lookup machinery is out of scope
/// (spec.md §1); this is the narrow seam the runner needs.
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    async fn dispatch(&self, command: serde_json::Value) -> anyhow::Result<()>;
}

/// Schedules the continuation job a suspended-for-resources or async-marked
/// step needs (spec.md §4.8.5): `{process_id}` on a named job the runtime
/// eventually routes back to `continue_scheduled`.
#[async_trait]
pub trait ContinuationScheduler: Send + Sync {
    async fn schedule_continuation(&self, process_id: i64) -> anyhow::Result<()>;
}

/// Declares a concrete process type's step/compensation schema and step
/// dispatch. Reflection is unavailable in a statically typed target (spec.md
/// §9 design note): this is the "explicit registration" alternative the
/// design notes call for, expressed as a match-based dispatch table instead
/// of a runtime-populated map.
#[async_trait]
pub trait LongProcessDefinition: Send + Sync {
    fn process_class(&self) -> &'static str;

    /// Forward steps, in declared order. Event handlers (steps that consume
    /// a resumed event as their second argument) are not listed separately —
    /// they occupy their normal position in this order.
    fn steps(&self) -> Vec<String>;

    /// Forward step name -> compensation method name.
    fn compensations(&self) -> std::collections::HashMap<String, String>;

    /// Step names that must be rescheduled rather than executed inline.
    fn async_steps(&self) -> Vec<String> {
        Vec::new()
    }

    async fn execute_step(
        &self,
        step: &str,
        payload: Option<Tagged>,
        resumed_event: Option<Tagged>,
    ) -> anyhow::Result<StepOutcome>;

    async fn execute_compensation(
        &self,
        compensation: &str,
        cause: &str,
        checkpoint: Option<Tagged>,
    ) -> anyhow::Result<StepOutcome>;
}
