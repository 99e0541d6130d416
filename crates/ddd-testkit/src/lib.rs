//! All-in-memory composition harness for scenario tests (spec.md §8).
//!
//! Mirrors the teacher's offline orchestrator: every engine is wired
//! in-memory in one place so a scenario test can drive a command through
//! the real pipeline and inspect every downstream effect — outbox rows,
//! dispatched domain events, queued jobs — without a database.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ddd_audit::InMemoryCommandAuditRepository;
use ddd_events::{DomainEvent, DomainEventDispatcher, EventRouter, IntegrationEventBus};
use ddd_outbox::{
    AsyncQueue, BackoffPolicy, InMemoryOutboxStore, OutboxBus, OutboxProcessor, OutboxPublisher,
    OutboxRouter, ProcessingResult,
};
use ddd_pipeline::{CommandPipeline, NoopTransactionManager, TransactionManager};
use ddd_schemas::TenantId;

/// Captures every job handed to the in-process async queue, so a scenario
/// can assert on exactly what the outbox router published (spec.md S1).
#[derive(Default)]
pub struct RecordingQueue {
    pub enqueued: Mutex<Vec<(String, serde_json::Value, String)>>,
    pub scheduled: Mutex<Vec<(DateTime<Utc>, String, serde_json::Value, String)>>,
}

impl RecordingQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// `OutboxRouter` takes an owned `Box<dyn AsyncQueue>`; this adapter lets the
/// harness keep its own `Arc<RecordingQueue>` for post-hoc assertions while
/// handing the router a distinct handle onto the same recorded state.
struct QueueHandle(Arc<RecordingQueue>);

#[async_trait]
impl AsyncQueue for QueueHandle {
    async fn enqueue_async(&self, name: &str, payload: serde_json::Value, group: &str) -> anyhow::Result<()> {
        self.0.enqueued.lock().unwrap().push((name.to_string(), payload, group.to_string()));
        Ok(())
    }

    async fn schedule_single(
        &self,
        at: DateTime<Utc>,
        name: &str,
        payload: serde_json::Value,
        group: &str,
    ) -> anyhow::Result<()> {
        self.0
            .scheduled
            .lock()
            .unwrap()
            .push((at, name.to_string(), payload, group.to_string()));
        Ok(())
    }
}

/// Records the names of every domain event dispatched in-process, standing
/// in for a host's real hook/action dispatch (spec.md §6).
#[derive(Default)]
pub struct RecordingDispatcher {
    pub names: Mutex<Vec<String>>,
}

#[async_trait]
impl DomainEventDispatcher for RecordingDispatcher {
    async fn dispatch(&self, event: &dyn DomainEvent) -> anyhow::Result<()> {
        self.names.lock().unwrap().push(event.name().to_string());
        Ok(())
    }
}

/// Everything a command-to-outbox scenario test needs, wired together:
/// a real [`CommandPipeline`] over a real [`InMemoryOutboxStore`], and an
/// [`OutboxProcessor`] whose router hands jobs to an inspectable queue.
pub struct Harness {
    pub pipeline: CommandPipeline,
    pub store: Arc<InMemoryOutboxStore>,
    pub queue: Arc<RecordingQueue>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub audit: Arc<InMemoryCommandAuditRepository>,
    processor: OutboxProcessor,
}

impl Harness {
    pub fn new(blog_id: TenantId, max_attempts: u32) -> Self {
        Self::with_worker(blog_id, max_attempts, "test-worker", Duration::from_secs(300))
    }

    pub fn with_worker(blog_id: TenantId, max_attempts: u32, worker_id: &str, lock_timeout: Duration) -> Self {
        let store = Arc::new(InMemoryOutboxStore::new());
        let bus: Arc<dyn IntegrationEventBus> = Arc::new(OutboxBus::new(store.clone(), max_attempts, blog_id));
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let router = Arc::new(EventRouter::new(dispatcher.clone(), bus));
        let audit = Arc::new(InMemoryCommandAuditRepository::new());
        let tx_manager: Arc<dyn TransactionManager> = Arc::new(NoopTransactionManager);
        let pipeline = CommandPipeline::new(audit.clone(), tx_manager, router);

        let queue = RecordingQueue::new();
        let publisher: Arc<dyn OutboxPublisher> =
            Arc::new(OutboxRouter::with_defaults(None, Box::new(QueueHandle(queue.clone()))));
        let processor = OutboxProcessor::new(
            store.clone(),
            publisher,
            worker_id,
            10,
            lock_timeout,
            BackoffPolicy::default(),
        );

        Self { pipeline, store, queue, dispatcher, audit, processor }
    }

    /// Run one outbox processor tick (release stale locks, claim, publish).
    pub async fn tick(&self) -> anyhow::Result<ProcessingResult> {
        self.processor.process_batch().await
    }
}
