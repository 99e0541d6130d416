//! ProcessSteps value object (spec.md §4.7, C7).

use std::collections::HashMap;

use ddd_schemas::Tagged;
use serde::{Deserialize, Serialize};

/// Frozen step schema + checkpoint ledger + compensation cursor, embedded in
/// a `LongProcess` row. `steps` and `compensations` are snapshotted once at
/// process start from the concrete process type's [`crate::definition::LongProcessDefinition`]
/// and never updated afterwards (spec.md §3 invariant, U8): a code change to
/// the process type requires declaring a new `process_class`, not mutating
/// an in-flight one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSteps {
    steps: Vec<String>,
    compensations: HashMap<String, String>,
    checkpoints: HashMap<String, Tagged>,
    step_index: usize,
    /// -1 means "not compensating". Signed so the sentinel has a value
    /// distinct from any valid index.
    undo_index: i64,
    failure_msg: Option<String>,
}

impl ProcessSteps {
    /// Freeze a new schema at process start. `compensations` maps a forward
    /// step name to the compensation method name that undoes it.
    pub fn new(steps: Vec<String>, compensations: HashMap<String, String>) -> Self {
        Self {
            steps,
            compensations,
            checkpoints: HashMap::new(),
            step_index: 0,
            undo_index: -1,
            failure_msg: None,
        }
    }

    pub fn is_compensating(&self) -> bool {
        self.undo_index >= 0
    }

    pub fn is_complete(&self) -> bool {
        self.step_index >= self.steps.len()
    }

    pub fn current_step(&self) -> Option<&str> {
        self.steps.get(self.step_index).map(String::as_str)
    }

    pub fn current_undo_step(&self) -> Option<&str> {
        if self.undo_index < 0 {
            return None;
        }
        self.steps.get(self.undo_index as usize).map(String::as_str)
    }

    pub fn compensation_for(&self, step: &str) -> Option<&str> {
        self.compensations.get(step).map(String::as_str)
    }

    pub fn checkpoint_for(&self, step: &str) -> Option<&Tagged> {
        self.checkpoints.get(step)
    }

    /// The step at `step_index` at the moment compensation begins — the one
    /// whose forward execution threw.
    pub fn failed_step(&self) -> Option<&str> {
        self.steps.get(self.step_index).map(String::as_str)
    }

    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    pub fn completed_count(&self) -> usize {
        self.step_index.min(self.steps.len())
    }

    pub fn failure_msg(&self) -> Option<&str> {
        self.failure_msg.as_deref()
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }

    pub fn undo_index(&self) -> i64 {
        self.undo_index
    }

    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    pub fn compensations(&self) -> &HashMap<String, String> {
        &self.compensations
    }

    pub fn advance(&mut self) {
        self.step_index += 1;
    }

    pub fn record_checkpoint(&mut self, step: &str, value: Option<Tagged>) {
        match value {
            Some(v) => {
                self.checkpoints.insert(step.to_string(), v);
            }
            None => {
                self.checkpoints.remove(step);
            }
        }
    }

    /// Begin compensation: `undo_index = step_index - 1`, i.e. start
    /// compensating the last step that completed successfully (the failing
    /// step itself never ran a checkpoint, so it has nothing to undo).
    pub fn begin_undo(&mut self, msg: impl Into<String>) {
        self.undo_index = self.step_index as i64 - 1;
        self.failure_msg = Some(msg.into());
    }

    pub fn advance_undo(&mut self) {
        self.undo_index -= 1;
    }

    pub fn finish_undo(&mut self) {
        self.undo_index = -1;
    }
}
