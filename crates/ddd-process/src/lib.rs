//! Long-process runner: a DB-backed saga engine for multi-step,
//! possibly-suspending business processes (spec.md §3, §4.7–§4.8, C7/C8).

mod model;
mod runner;
mod steps;

pub use model::{
    AwaitEvent, CommandDispatcher, ContinuationScheduler, LongProcess, LongProcessDefinition,
    ProcessRepository, StepOutcome,
};
pub use runner::{LongProcessRunner, MemorySampler, NoMemorySampler, ProcessError};
pub use steps::ProcessSteps;
