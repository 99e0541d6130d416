//! Outbox processor: claim-and-process loop (spec.md §4.5, C5).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ddd_correlation::{ENVELOPE_CORRELATION_ID, ENVELOPE_EVENT_ID, ENVELOPE_SEQUENCE};

use crate::store::{BackoffPolicy, OutboxEntry, OutboxStore};

/// Where a claimed entry ends up being handed off (C6). The built-in
/// [`crate::publisher::OutboxRouter`] implements this by resolving a
/// transport and delegating to the external sink or the async queue;
/// any other transport (a message broker client, say) can implement it
/// directly.
#[async_trait]
pub trait OutboxPublisher: Send + Sync {
    async fn publish(&self, entry: &OutboxEntry, wrapped_payload: serde_json::Value) -> anyhow::Result<()>;
}

/// Counts returned by one processor tick (spec.md §4.5 step 4).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessingResult {
    pub completed: u64,
    pub failed: u64,
    pub dlq: u64,
    pub total: u64,
}

/// Copy the stored payload and inject the three envelope keys (spec.md §6).
fn wrap_payload(entry: &OutboxEntry) -> serde_json::Value {
    let mut payload = entry.payload.clone();
    if let serde_json::Value::Object(map) = &mut payload {
        map.insert(
            ENVELOPE_CORRELATION_ID.to_string(),
            serde_json::Value::String(entry.correlation_id.to_string()),
        );
        map.insert(ENVELOPE_SEQUENCE.to_string(), serde_json::json!(entry.sequence));
        map.insert(
            ENVELOPE_EVENT_ID.to_string(),
            serde_json::Value::String(entry.event_id.to_string()),
        );
    }
    payload
}

pub struct OutboxProcessor {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn OutboxPublisher>,
    worker_id: String,
    batch_size: u32,
    lock_timeout: Duration,
    backoff: BackoffPolicy,
}

impl OutboxProcessor {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn OutboxPublisher>,
        worker_id: impl Into<String>,
        batch_size: u32,
        lock_timeout: Duration,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            publisher,
            worker_id: worker_id.into(),
            batch_size,
            lock_timeout,
            backoff,
        }
    }

    /// `hostname + process id`, as spec.md §4.5 prescribes for `worker_id`.
    pub fn worker_id(hostname: &str) -> String {
        format!("{hostname}-{}", std::process::id())
    }

    /// Run one batch: release stale locks, claim pending rows, publish each.
    pub async fn process_batch(&self) -> anyhow::Result<ProcessingResult> {
        let released = self.store.release_stale_locks(self.lock_timeout).await?;
        if released > 0 {
            tracing::info!(released, worker_id = %self.worker_id, "released stale outbox locks");
        }

        let entries = self.store.fetch_pending(self.batch_size, &self.worker_id).await?;
        if entries.is_empty() {
            return Ok(ProcessingResult::default());
        }

        let mut result = ProcessingResult::default();
        for entry in &entries {
            result.total += 1;
            let wrapped = wrap_payload(entry);
            match self.publisher.publish(entry, wrapped).await {
                Ok(()) => {
                    self.store.mark_completed(entry.event_id).await?;
                    result.completed += 1;
                    tracing::info!(event_id = %entry.event_id, correlation_id = %entry.correlation_id, worker_id = %self.worker_id, "outbox entry published");
                }
                Err(err) => {
                    let new_attempts = entry.attempts + 1;
                    self.store
                        .mark_failed(entry.event_id, &err.to_string(), self.backoff)
                        .await?;
                    if new_attempts >= entry.max_attempts {
                        self.store.move_to_dlq(entry.event_id).await?;
                        result.dlq += 1;
                        tracing::error!(event_id = %entry.event_id, attempts = new_attempts, "outbox entry moved to dlq");
                    } else {
                        result.failed += 1;
                        tracing::warn!(event_id = %entry.event_id, attempts = new_attempts, error = %err, "outbox publish failed, will retry");
                    }
                }
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryOutboxStore, NewOutboxEntry};
    use ddd_schemas::{MessageKind, OutboxStatus, TenantId, Transport};
    use std::sync::Mutex;
    use uuid::Uuid;

    fn entry(event_type: &str, max_attempts: u32) -> NewOutboxEntry {
        NewOutboxEntry {
            event_type: event_type.to_string(),
            integration_action: format!("{event_type}.action"),
            message_kind: MessageKind::Event,
            transport: Transport::InProcess,
            queue: None,
            payload: serde_json::json!({"user_id": 7, "amount": 5}),
            correlation_id: Uuid::new_v4(),
            sequence: 1,
            command_id: None,
            delay_seconds: 0,
            is_unique: false,
            max_attempts,
            blog_id: TenantId(1),
        }
    }

    struct AlwaysSucceeds {
        received: Mutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl OutboxPublisher for AlwaysSucceeds {
        async fn publish(&self, _entry: &OutboxEntry, wrapped_payload: serde_json::Value) -> anyhow::Result<()> {
            self.received.lock().unwrap().push(wrapped_payload);
            Ok(())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl OutboxPublisher for AlwaysFails {
        async fn publish(&self, _entry: &OutboxEntry, _wrapped_payload: serde_json::Value) -> anyhow::Result<()> {
            anyhow::bail!("sink unreachable")
        }
    }

    #[tokio::test]
    async fn happy_path_wraps_payload_and_completes() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let event_id = store.write(entry("UserEarned", 5)).await.unwrap();
        let publisher = Arc::new(AlwaysSucceeds {
            received: Mutex::new(vec![]),
        });
        let processor = OutboxProcessor::new(
            store.clone(),
            publisher.clone(),
            "worker-a",
            10,
            Duration::from_secs(300),
            BackoffPolicy::default(),
        );

        let result = processor.process_batch().await.unwrap();
        assert_eq!(result, ProcessingResult { completed: 1, failed: 0, dlq: 0, total: 1 });

        let row = store.find_by_event_id(event_id).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Completed);

        let received = publisher.received.lock().unwrap();
        let wrapped = &received[0];
        assert_eq!(wrapped["user_id"], 7);
        assert_eq!(wrapped["__sequence"], 1);
        assert!(wrapped["__correlation_id"].is_string());
        assert!(wrapped["__event_id"].is_string());
    }

    #[tokio::test]
    async fn empty_queue_returns_zeroed_result() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let publisher = Arc::new(AlwaysSucceeds {
            received: Mutex::new(vec![]),
        });
        let processor = OutboxProcessor::new(
            store,
            publisher,
            "worker-a",
            10,
            Duration::from_secs(300),
            BackoffPolicy::default(),
        );
        assert_eq!(processor.process_batch().await.unwrap(), ProcessingResult::default());
    }

    #[tokio::test]
    async fn failure_below_max_attempts_reschedules_not_dlq() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let event_id = store.write(entry("X", 5)).await.unwrap();
        let processor = OutboxProcessor::new(
            store.clone(),
            Arc::new(AlwaysFails),
            "worker-a",
            10,
            Duration::from_secs(300),
            BackoffPolicy::default(),
        );
        let result = processor.process_batch().await.unwrap();
        assert_eq!(result.failed, 1);
        assert_eq!(result.dlq, 0);
        let row = store.find_by_event_id(event_id).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Pending);
        assert_eq!(row.attempts, 1);
    }

    #[tokio::test]
    async fn failure_at_last_attempt_moves_to_dlq() {
        let store = Arc::new(InMemoryOutboxStore::new());
        // max_attempts = 1: the very first failure exhausts the budget.
        let event_id = store.write(entry("X", 1)).await.unwrap();
        let processor = OutboxProcessor::new(
            store.clone(),
            Arc::new(AlwaysFails),
            "worker-a",
            10,
            Duration::from_secs(300),
            BackoffPolicy::default(),
        );
        let result = processor.process_batch().await.unwrap();
        assert_eq!(result.dlq, 1);
        let row = store.find_by_event_id(event_id).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Dlq);
        let dlq = store.list_dlq().await.unwrap();
        assert_eq!(dlq[0].final_error, "sink unreachable");
    }
}
