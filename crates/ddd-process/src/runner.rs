//! Long-process runner: the saga engine (spec.md §4.8, C8).

use std::collections::HashMap;
use std::sync::Arc;

use ddd_schemas::{ResourceBudget, Tagged};
use uuid::Uuid;

use crate::model::{CommandDispatcher, ContinuationScheduler, LongProcess, LongProcessDefinition, ProcessRepository};

/// Errors raised by the runner itself, as opposed to a process definition's
/// own step logic (which surfaces as an opaque `anyhow::Error` and triggers
/// compensation, per spec.md §4.8.2).
#[derive(Debug)]
pub enum ProcessError {
    /// Invariant kind (spec.md §7): no definition registered for this
    /// process's `process_class`. This should never happen for a process
    /// that was started through this runner.
    UnknownProcessClass(String),
    /// Ref-not-found kind (spec.md §7).
    ProcessNotFound(i64),
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownProcessClass(class) => write!(f, "no process definition registered for '{class}'"),
            Self::ProcessNotFound(id) => write!(f, "process {id} not found"),
        }
    }
}

impl std::error::Error for ProcessError {}

/// Samples current memory usage as a fraction of the configured cap (spec.md
/// §4.14). Memory sampling is host-specific; the default never reports
/// pressure, so budgets degrade gracefully to a pure wall-clock check.
pub trait MemorySampler: Send + Sync {
    fn current_fraction(&self) -> f64 {
        0.0
    }
}

pub struct NoMemorySampler;
impl MemorySampler for NoMemorySampler {}

pub struct LongProcessRunner {
    repo: Arc<dyn ProcessRepository>,
    definitions: HashMap<String, Arc<dyn LongProcessDefinition>>,
    commands: Arc<dyn CommandDispatcher>,
    scheduler: Arc<dyn ContinuationScheduler>,
    memory: Arc<dyn MemorySampler>,
    max_execution_seconds: u64,
    memory_limit_percent: f64,
}

impl LongProcessRunner {
    pub fn new(
        repo: Arc<dyn ProcessRepository>,
        definitions: Vec<Arc<dyn LongProcessDefinition>>,
        commands: Arc<dyn CommandDispatcher>,
        scheduler: Arc<dyn ContinuationScheduler>,
    ) -> Self {
        Self::with_budget(repo, definitions, commands, scheduler, 25, 0.8, Arc::new(NoMemorySampler))
    }

    pub fn with_budget(
        repo: Arc<dyn ProcessRepository>,
        definitions: Vec<Arc<dyn LongProcessDefinition>>,
        commands: Arc<dyn CommandDispatcher>,
        scheduler: Arc<dyn ContinuationScheduler>,
        max_execution_seconds: u64,
        memory_limit_percent: f64,
        memory: Arc<dyn MemorySampler>,
    ) -> Self {
        let definitions = definitions
            .into_iter()
            .map(|d| (d.process_class().to_string(), d))
            .collect();
        Self {
            repo,
            definitions,
            commands,
            scheduler,
            memory,
            max_execution_seconds,
            memory_limit_percent,
        }
    }

    fn definition_for(&self, process: &LongProcess) -> Result<Arc<dyn LongProcessDefinition>, ProcessError> {
        self.definitions
            .get(&process.process_class)
            .cloned()
            .ok_or_else(|| ProcessError::UnknownProcessClass(process.process_class.clone()))
    }

    /// Start a freshly constructed process: persist it, then run forward.
    pub async fn start(&self, mut process: LongProcess) -> anyhow::Result<i64> {
        let correlation_id = process.correlation_id;
        let id = self.repo.save(&mut process).await?;
        let ctx = ddd_correlation::CorrelationContext::with_id(correlation_id);
        ddd_correlation::scope(ctx, self.run(&mut process, None)).await?;
        Ok(id)
    }

    /// Resume a process that was rescheduled because it was async-marked or
    /// hit its resource budget (spec.md §4.8.5).
    pub async fn continue_scheduled(&self, process_id: i64) -> anyhow::Result<()> {
        let Some(mut process) = self.repo.find(process_id).await? else {
            return Err(ProcessError::ProcessNotFound(process_id).into());
        };
        if process.is_terminal() {
            return Ok(());
        }
        let ctx = ddd_correlation::CorrelationContext::with_id(process.correlation_id);
        ddd_correlation::scope(ctx, self.run(&mut process, None)).await
    }

    /// On an integration event, resume the first suspended process whose
    /// `waiting_for` matches and whose `match_criteria` is satisfied by
    /// `event_fields` (spec.md §4.8.4). Only one process resumes per event.
    pub async fn resume_on_event(
        &self,
        event_class: &str,
        event_fields: &serde_json::Value,
        event_payload: Tagged,
    ) -> anyhow::Result<bool> {
        let candidates = self.repo.find_waiting_for(event_class).await?;
        for mut process in candidates {
            let Some(criteria) = process.match_criteria.clone() else {
                continue;
            };
            if !matches_strict(&criteria, event_fields) {
                continue;
            }
            process.steps.advance();
            let ctx = ddd_correlation::CorrelationContext::with_id(process.correlation_id);
            ddd_correlation::scope(ctx, self.run(&mut process, Some(event_payload))).await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn run(&self, process: &mut LongProcess, resume_event: Option<Tagged>) -> anyhow::Result<()> {
        if process.steps.is_compensating() {
            self.execute_compensation(process).await
        } else {
            self.execute_forward(process, resume_event).await
        }
    }

    async fn execute_forward(
        &self,
        process: &mut LongProcess,
        mut resume_event: Option<Tagged>,
    ) -> anyhow::Result<()> {
        let budget = ResourceBudget::new(self.max_execution_seconds, self.memory_limit_percent);
        let definition = self.definition_for(process)?;

        loop {
            if process.steps.is_complete() {
                process.set_completed();
                self.repo.save(process).await?;
                return Ok(());
            }

            let current = process.steps.current_step().unwrap().to_string();
            if definition.async_steps().iter().any(|s| s == &current) {
                process.set_scheduled();
                let id = self.repo.save(process).await?;
                self.scheduler.schedule_continuation(id).await?;
                return Ok(());
            }

            let payload = process.payload.clone();
            let event_for_step = resume_event.take();
            let outcome = match definition.execute_step(&current, payload, event_for_step).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::warn!(step = %current, error = %err, "forward step failed, beginning compensation");
                    process.steps.begin_undo(err.to_string());
                    process.last_error = Some(err.to_string());
                    self.repo.save(process).await?;
                    return self.execute_compensation(process).await;
                }
            };

            for command in outcome.commands {
                self.commands.dispatch(command).await?;
            }

            if let Some(await_event) = outcome.await_event {
                process.set_suspended(await_event.event_class, await_event.match_criteria, outcome.payload);
                self.repo.save(process).await?;
                return Ok(());
            }

            process.steps.record_checkpoint(&current, outcome.checkpoint);
            process.steps.advance();
            process.set_running(outcome.payload);
            self.repo.save(process).await?;

            if budget.exceeded(self.memory.current_fraction()) {
                process.set_scheduled();
                let id = self.repo.save(process).await?;
                self.scheduler.schedule_continuation(id).await?;
                return Ok(());
            }
        }
    }

    async fn execute_compensation(&self, process: &mut LongProcess) -> anyhow::Result<()> {
        let budget = ResourceBudget::new(self.max_execution_seconds, self.memory_limit_percent);
        let definition = self.definition_for(process)?;

        loop {
            if process.steps.undo_index() < 0 {
                process.steps.finish_undo();
                let message = process
                    .steps
                    .failure_msg()
                    .unwrap_or("compensation complete")
                    .to_string();
                process.set_failed(message);
                self.repo.save(process).await?;
                return Ok(());
            }

            let current_undo = process.steps.current_undo_step().unwrap().to_string();
            let Some(compensation) = process.steps.compensation_for(&current_undo).map(str::to_string) else {
                process.steps.advance_undo();
                self.repo.save(process).await?;
                continue;
            };

            if definition.async_steps().iter().any(|s| s == &compensation) {
                process.set_scheduled();
                let id = self.repo.save(process).await?;
                self.scheduler.schedule_continuation(id).await?;
                return Ok(());
            }

            let checkpoint = process.steps.checkpoint_for(&current_undo).cloned();
            let cause = process.steps.failure_msg().unwrap_or_default().to_string();
            let outcome = match definition.execute_compensation(&compensation, &cause, checkpoint).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    process.set_failed(format!("Compensation failed: {err}"));
                    self.repo.save(process).await?;
                    return Err(err);
                }
            };

            for command in outcome.commands {
                self.commands.dispatch(command).await?;
            }

            if let Some(await_event) = outcome.await_event {
                process.set_suspended(await_event.event_class, await_event.match_criteria, outcome.payload);
                self.repo.save(process).await?;
                return Ok(());
            }

            process.payload = outcome.payload;
            process.steps.advance_undo();
            self.repo.save(process).await?;

            if budget.exceeded(self.memory.current_fraction()) {
                process.set_scheduled();
                let id = self.repo.save(process).await?;
                self.scheduler.schedule_continuation(id).await?;
                return Ok(());
            }
        }
    }
}

/// Strict equality on event fields (spec.md §4.8.4): every key in `criteria`
/// must be present in `event_fields` with an identical value.
fn matches_strict(criteria: &serde_json::Value, event_fields: &serde_json::Value) -> bool {
    let (Some(criteria_obj), Some(event_obj)) = (criteria.as_object(), event_fields.as_object()) else {
        return criteria == event_fields;
    };
    criteria_obj
        .iter()
        .all(|(k, v)| event_obj.get(k).map(|actual| actual == v).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StepOutcome;
    use async_trait::async_trait;
    use ddd_schemas::{ProcessStatus, TenantId};
    use std::sync::Mutex;

    fn new_process(steps: Vec<&str>, compensations: &[(&str, &str)]) -> LongProcess {
        let mut map = HashMap::new();
        for (k, v) in compensations {
            map.insert(k.to_string(), v.to_string());
        }
        let schema = crate::steps::ProcessSteps::new(steps.into_iter().map(String::from).collect(), map);
        LongProcess::start("TestProcess", serde_json::json!({}), schema, Uuid::new_v4(), TenantId(1))
    }

    #[derive(Default)]
    struct InMemoryProcessRepo {
        rows: Mutex<HashMap<i64, LongProcess>>,
        next_id: Mutex<i64>,
    }

    #[async_trait]
    impl ProcessRepository for InMemoryProcessRepo {
        async fn save(&self, process: &mut LongProcess) -> anyhow::Result<i64> {
            let id = match process.id {
                Some(id) => id,
                None => {
                    let mut next_id = self.next_id.lock().unwrap();
                    *next_id += 1;
                    let id = *next_id;
                    process.id = Some(id);
                    id
                }
            };
            self.rows.lock().unwrap().insert(id, process.clone());
            Ok(id)
        }

        async fn find(&self, id: i64) -> anyhow::Result<Option<LongProcess>> {
            Ok(self.rows.lock().unwrap().get(&id).cloned())
        }

        async fn find_waiting_for(&self, event_class: &str) -> anyhow::Result<Vec<LongProcess>> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .values()
                .filter(|p| p.status == ProcessStatus::Suspended && p.waiting_for.as_deref() == Some(event_class))
                .cloned()
                .collect())
        }

        async fn delete(&self, id: i64) -> anyhow::Result<()> {
            self.rows.lock().unwrap().remove(&id);
            Ok(())
        }
    }

    struct NoopCommands;
    #[async_trait]
    impl CommandDispatcher for NoopCommands {
        async fn dispatch(&self, _command: serde_json::Value) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingScheduler {
        scheduled: Mutex<Vec<i64>>,
    }
    #[async_trait]
    impl ContinuationScheduler for RecordingScheduler {
        async fn schedule_continuation(&self, process_id: i64) -> anyhow::Result<()> {
            self.scheduled.lock().unwrap().push(process_id);
            Ok(())
        }
    }

    /// Drives steps `[a, b, c]`: `b` suspends awaiting `PaymentReceived{order_id:42}`.
    struct AwaitResumeDefinition;
    #[async_trait]
    impl LongProcessDefinition for AwaitResumeDefinition {
        fn process_class(&self) -> &'static str {
            "TestProcess"
        }
        fn steps(&self) -> Vec<String> {
            vec!["a".into(), "b".into(), "c".into()]
        }
        fn compensations(&self) -> HashMap<String, String> {
            HashMap::new()
        }
        async fn execute_step(
            &self,
            step: &str,
            _payload: Option<Tagged>,
            resumed_event: Option<Tagged>,
        ) -> anyhow::Result<StepOutcome> {
            match step {
                "a" => Ok(StepOutcome {
                    payload: Some(Tagged::new("P1", serde_json::json!({"v": 1}))),
                    ..Default::default()
                }),
                "b" => Ok(StepOutcome {
                    payload: Some(Tagged::new("P1", serde_json::json!({"v": 1}))),
                    await_event: Some(crate::model::AwaitEvent {
                        event_class: "PaymentReceived".into(),
                        match_criteria: serde_json::json!({"order_id": 42}),
                    }),
                    ..Default::default()
                }),
                "c" => {
                    assert!(resumed_event.is_some(), "c must receive the resumed event");
                    Ok(StepOutcome::default())
                }
                other => panic!("unexpected step {other}"),
            }
        }
        async fn execute_compensation(
            &self,
            _compensation: &str,
            _cause: &str,
            _checkpoint: Option<Tagged>,
        ) -> anyhow::Result<StepOutcome> {
            unreachable!("no compensations registered")
        }
    }

    #[tokio::test]
    async fn s5_await_then_resume_completes_the_process() {
        let repo = Arc::new(InMemoryProcessRepo::default());
        let runner = LongProcessRunner::new(
            repo.clone(),
            vec![Arc::new(AwaitResumeDefinition)],
            Arc::new(NoopCommands),
            Arc::new(RecordingScheduler::default()),
        );

        let process = new_process(vec!["a", "b", "c"], &[]);
        let id = runner.start(process).await.unwrap();

        let suspended = repo.find(id).await.unwrap().unwrap();
        assert_eq!(suspended.status, ProcessStatus::Suspended);
        assert_eq!(suspended.waiting_for.as_deref(), Some("PaymentReceived"));

        let resumed = runner
            .resume_on_event(
                "PaymentReceived",
                &serde_json::json!({"order_id": 42, "amount": 10}),
                Tagged::new("PaymentReceived", serde_json::json!({"order_id": 42, "amount": 10})),
            )
            .await
            .unwrap();
        assert!(resumed);

        let completed = repo.find(id).await.unwrap().unwrap();
        assert_eq!(completed.status, ProcessStatus::Completed);
    }

    #[tokio::test]
    async fn resume_on_event_ignores_non_matching_criteria() {
        let repo = Arc::new(InMemoryProcessRepo::default());
        let runner = LongProcessRunner::new(
            repo.clone(),
            vec![Arc::new(AwaitResumeDefinition)],
            Arc::new(NoopCommands),
            Arc::new(RecordingScheduler::default()),
        );
        let process = new_process(vec!["a", "b", "c"], &[]);
        runner.start(process).await.unwrap();

        let resumed = runner
            .resume_on_event(
                "PaymentReceived",
                &serde_json::json!({"order_id": 999}),
                Tagged::new("PaymentReceived", serde_json::json!({"order_id": 999})),
            )
            .await
            .unwrap();
        assert!(!resumed);
    }

    /// Drives steps `[charge, ship]`: `charge` checkpoints, `ship` throws.
    struct ChargeShipDefinition;
    #[async_trait]
    impl LongProcessDefinition for ChargeShipDefinition {
        fn process_class(&self) -> &'static str {
            "TestProcess"
        }
        fn steps(&self) -> Vec<String> {
            vec!["charge".into(), "ship".into()]
        }
        fn compensations(&self) -> HashMap<String, String> {
            let mut m = HashMap::new();
            m.insert("charge".to_string(), "refund_charge".to_string());
            m
        }
        async fn execute_step(
            &self,
            step: &str,
            _payload: Option<Tagged>,
            _resumed_event: Option<Tagged>,
        ) -> anyhow::Result<StepOutcome> {
            match step {
                "charge" => Ok(StepOutcome {
                    checkpoint: Some(Tagged::new("ChargeCheckpoint", serde_json::json!({"txn": "t1"}))),
                    ..Default::default()
                }),
                "ship" => anyhow::bail!("carrier rejected the shipment"),
                other => panic!("unexpected step {other}"),
            }
        }
        async fn execute_compensation(
            &self,
            compensation: &str,
            cause: &str,
            checkpoint: Option<Tagged>,
        ) -> anyhow::Result<StepOutcome> {
            assert_eq!(compensation, "refund_charge");
            assert!(cause.contains("carrier rejected"));
            assert_eq!(checkpoint.unwrap().data["txn"], "t1");
            Ok(StepOutcome::default())
        }
    }

    #[tokio::test]
    async fn s6_forward_failure_triggers_compensation_then_fails() {
        let repo = Arc::new(InMemoryProcessRepo::default());
        let runner = LongProcessRunner::new(
            repo.clone(),
            vec![Arc::new(ChargeShipDefinition)],
            Arc::new(NoopCommands),
            Arc::new(RecordingScheduler::default()),
        );
        let process = new_process(vec!["charge", "ship"], &[("charge", "refund_charge")]);
        let id = runner.start(process).await.unwrap();

        let failed = repo.find(id).await.unwrap().unwrap();
        assert_eq!(failed.status, ProcessStatus::Failed);
        assert!(failed.last_error.unwrap().contains("carrier rejected"));
        assert_eq!(failed.steps.undo_index(), -1);
    }

    #[tokio::test]
    async fn compensation_that_throws_marks_process_failed_and_resurfaces() {
        struct AlwaysThrowsCompensation;
        #[async_trait]
        impl LongProcessDefinition for AlwaysThrowsCompensation {
            fn process_class(&self) -> &'static str {
                "TestProcess"
            }
            fn steps(&self) -> Vec<String> {
                vec!["charge".into(), "ship".into()]
            }
            fn compensations(&self) -> HashMap<String, String> {
                let mut m = HashMap::new();
                m.insert("charge".to_string(), "refund_charge".to_string());
                m
            }
            async fn execute_step(
                &self,
                step: &str,
                _payload: Option<Tagged>,
                _resumed_event: Option<Tagged>,
            ) -> anyhow::Result<StepOutcome> {
                match step {
                    "charge" => Ok(StepOutcome::default()),
                    "ship" => anyhow::bail!("ship failed"),
                    other => panic!("unexpected step {other}"),
                }
            }
            async fn execute_compensation(
                &self,
                _compensation: &str,
                _cause: &str,
                _checkpoint: Option<Tagged>,
            ) -> anyhow::Result<StepOutcome> {
                anyhow::bail!("refund gateway unreachable")
            }
        }

        let repo = Arc::new(InMemoryProcessRepo::default());
        let runner = LongProcessRunner::new(
            repo.clone(),
            vec![Arc::new(AlwaysThrowsCompensation)],
            Arc::new(NoopCommands),
            Arc::new(RecordingScheduler::default()),
        );
        let process = new_process(vec!["charge", "ship"], &[("charge", "refund_charge")]);
        let result = runner.start(process).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn async_marked_step_reschedules_instead_of_running_inline() {
        struct AsyncStepDefinition;
        #[async_trait]
        impl LongProcessDefinition for AsyncStepDefinition {
            fn process_class(&self) -> &'static str {
                "TestProcess"
            }
            fn steps(&self) -> Vec<String> {
                vec!["slow".into()]
            }
            fn compensations(&self) -> HashMap<String, String> {
                HashMap::new()
            }
            fn async_steps(&self) -> Vec<String> {
                vec!["slow".into()]
            }
            async fn execute_step(
                &self,
                _step: &str,
                _payload: Option<Tagged>,
                _resumed_event: Option<Tagged>,
            ) -> anyhow::Result<StepOutcome> {
                panic!("async-marked steps must be rescheduled, not executed inline")
            }
            async fn execute_compensation(
                &self,
                _c: &str,
                _cause: &str,
                _checkpoint: Option<Tagged>,
            ) -> anyhow::Result<StepOutcome> {
                unreachable!()
            }
        }

        let repo = Arc::new(InMemoryProcessRepo::default());
        let scheduler = Arc::new(RecordingScheduler::default());
        let runner = LongProcessRunner::new(
            repo.clone(),
            vec![Arc::new(AsyncStepDefinition)],
            Arc::new(NoopCommands),
            scheduler.clone(),
        );
        let process = new_process(vec!["slow"], &[]);
        let id = runner.start(process).await.unwrap();

        let row = repo.find(id).await.unwrap().unwrap();
        assert_eq!(row.status, ProcessStatus::Scheduled);
        assert_eq!(*scheduler.scheduled.lock().unwrap(), vec![id]);
    }
}
