//! Behaviour workflow engine: a batched, ledger-backed runner for
//! multi-phase, per-item business processes that can fork exhausted
//! retries into child workflows (spec.md §3, §4.9–§4.11, C9/C10/C11).

mod model;
mod runner;

pub use model::{
    BehaviourConfigHandler, BehaviourExecutionResult, BehaviourWorkflow, NewWorkItem, WorkItem,
    WorkItemList, WorkItemRepository, WorkflowRepository, WorkflowScheduler,
};
pub use runner::{BehaviourWorkflowRunner, MemorySampler, NoMemorySampler, WorkflowError};
