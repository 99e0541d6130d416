//! Boot sequence and background task composition (spec.md §4 supplemented
//! "Runtime wiring crate"), mirroring how the teacher's `mqk-runtime`
//! composes the execution, reconciliation, and broker engines into one set
//! of tasks a daemon process owns for its lifetime.

use std::sync::Arc;
use std::time::Duration;

use ddd_config::Settings;
use ddd_db::{PgOutboxStore, PgProcessRepository, PgWorkItemRepository, PgWorkflowRepository};
use ddd_outbox::{BackoffPolicy, OutboxProcessor, OutboxPublisher};
use ddd_process::{CommandDispatcher, LongProcessDefinition, LongProcessRunner};
use ddd_workflow::{BehaviourConfigHandler, BehaviourWorkflowRunner, WorkflowRepository};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::scheduler::{ChannelContinuationScheduler, ChannelWorkflowScheduler};

/// Everything a caller hands the runtime at boot, beyond the pool and
/// config. Each is a seam spec.md §1 keeps external to this system: the
/// host supplies its own process/behaviour definitions, its own outbox
/// transport, and its own fire-and-forget command dispatch.
pub struct RuntimeDeps {
    pub process_definitions: Vec<Arc<dyn LongProcessDefinition>>,
    pub behaviour_handlers: Vec<Arc<dyn BehaviourConfigHandler>>,
    pub publisher: Arc<dyn OutboxPublisher>,
    pub commands: Arc<dyn CommandDispatcher>,
}

/// A running set of background tasks plus the means to stop them cleanly.
pub struct RuntimeHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    pub config_hash: String,
}

impl RuntimeHandle {
    /// Start the outbox processor loop, the long-process continuation
    /// consumer, and the workflow continuation consumer as background
    /// tasks. Each loop honors the configured interval for its own ticking;
    /// continuations are delivered through in-process channels the instant
    /// the engines ask for them (see [`crate::scheduler`]).
    pub fn spawn(pool: PgPool, settings: Settings, worker_id: impl Into<String>, deps: RuntimeDeps) -> Self {
        let worker_id = worker_id.into();
        let config_hash = hash_settings(&settings);
        let (shutdown_tx, _) = watch::channel(false);

        let (process_tx, process_rx) = mpsc::unbounded_channel::<i64>();
        let (workflow_tx, workflow_rx) = mpsc::unbounded_channel::<(i64, u64)>();

        let outbox_store = Arc::new(PgOutboxStore::new(
            pool.clone(),
            Duration::from_secs(settings.outbox.lock_timeout_seconds),
        ));
        let processor = OutboxProcessor::new(
            outbox_store,
            deps.publisher,
            worker_id.clone(),
            settings.outbox.batch_size,
            Duration::from_secs(settings.outbox.lock_timeout_seconds),
            BackoffPolicy {
                base: Duration::from_secs(settings.outbox.base_retry_delay_seconds),
                multiplier: settings.outbox.retry_multiplier,
                max_delay: Duration::from_secs(settings.outbox.max_retry_delay_seconds),
            },
        );

        let process_repo = Arc::new(PgProcessRepository::new(pool.clone()));
        let process_runner = Arc::new(LongProcessRunner::with_budget(
            process_repo,
            deps.process_definitions,
            deps.commands,
            Arc::new(ChannelContinuationScheduler(process_tx)),
            settings.runner.max_execution_seconds,
            settings.runner.memory_limit_percent,
            Arc::new(ddd_process::NoMemorySampler),
        ));

        let workflow_repo: Arc<dyn WorkflowRepository> = Arc::new(PgWorkflowRepository::new(pool.clone()));
        let item_repo = Arc::new(PgWorkItemRepository::new(pool.clone()));
        let workflow_runner = Arc::new(BehaviourWorkflowRunner::with_budget(
            workflow_repo.clone(),
            item_repo,
            deps.behaviour_handlers,
            Arc::new(ChannelWorkflowScheduler(workflow_tx)),
            settings.workflow.max_retries,
            settings.workflow.reschedule_interval,
            settings.workflow.fork_delay_seconds,
            settings.runner.max_execution_seconds,
            settings.runner.memory_limit_percent,
            Arc::new(ddd_workflow::NoMemorySampler),
        ));

        let mut tasks = Vec::with_capacity(3);
        tasks.push(spawn_outbox_loop(
            processor,
            Duration::from_secs(settings.outbox.processor_interval_seconds),
            shutdown_tx.subscribe(),
        ));
        tasks.push(spawn_process_continuations(process_runner, process_rx, shutdown_tx.subscribe()));
        tasks.push(spawn_workflow_continuations(workflow_runner, workflow_repo, workflow_rx, shutdown_tx.subscribe()));

        tracing::info!(worker_id = %worker_id, config_hash = %config_hash, "runtime booted");

        Self { shutdown_tx, tasks, config_hash }
    }

    /// Signal every loop to stop accepting new work and wait for each to
    /// finish its current iteration. No batch claim or step execution is
    /// interrupted mid-flight: each loop only checks the shutdown signal
    /// between ticks, never inside one.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

fn spawn_outbox_loop(processor: OutboxProcessor, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match processor.process_batch().await {
                        Ok(result) => {
                            if result.total > 0 {
                                tracing::info!(completed = result.completed, failed = result.failed, dlq = result.dlq, "outbox batch processed");
                            }
                        }
                        Err(err) => tracing::error!(error = %err, "outbox batch failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    })
}

fn spawn_process_continuations(
    runner: Arc<LongProcessRunner>,
    mut rx: mpsc::UnboundedReceiver<i64>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe_id = rx.recv() => {
                    let Some(process_id) = maybe_id else { return };
                    if let Err(err) = runner.continue_scheduled(process_id).await {
                        tracing::error!(process_id, error = %err, "process continuation failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    })
}

fn spawn_workflow_continuations(
    runner: Arc<BehaviourWorkflowRunner>,
    repo: Arc<dyn WorkflowRepository>,
    mut rx: mpsc::UnboundedReceiver<(i64, u64)>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe_item = rx.recv() => {
                    let Some((workflow_id, delay_seconds)) = maybe_item else { return };
                    let runner = runner.clone();
                    let repo = repo.clone();
                    tokio::spawn(async move {
                        if delay_seconds > 0 {
                            tokio::time::sleep(Duration::from_secs(delay_seconds)).await;
                        }
                        match repo.get_by_id(workflow_id).await {
                            Ok(Some(mut workflow)) => {
                                if let Err(err) = runner.run_workflow(&mut workflow).await {
                                    tracing::error!(workflow_id, error = %err, "workflow continuation failed");
                                }
                            }
                            Ok(None) => tracing::warn!(workflow_id, "scheduled workflow no longer exists"),
                            Err(err) => tracing::error!(workflow_id, error = %err, "workflow lookup failed"),
                        }
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    })
}

/// SHA-256 over the settings' canonical JSON form, the same hashing
/// approach `ddd_config::load_layered_yaml` uses for its config hash, so a
/// boot log line and a config-loader hash are directly comparable.
fn hash_settings(settings: &Settings) -> String {
    let json = serde_json::to_value(settings).expect("Settings serialization must not fail");
    let canonical = serde_json::to_string(&sort_keys(&json)).expect("json serialization must not fail");
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn sort_keys(v: &serde_json::Value) -> serde_json::Value {
    match v {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            serde_json::Value::Object(new)
        }
        serde_json::Value::Array(arr) => serde_json::Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}
