//! Outbox publisher / router (spec.md §4.6, C6).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ddd_schemas::Transport;

use crate::processor::OutboxPublisher;
use crate::store::OutboxEntry;

/// An injected, replaceable handler for the `external` transport. Returns
/// whether it handled the entry; `false` means "declined", not an error.
#[async_trait]
pub trait ExternalSink: Send + Sync {
    async fn handle(&self, entry: &OutboxEntry, wrapped_payload: &serde_json::Value) -> anyhow::Result<bool>;
}

/// At-least-once dispatch of a named job, optionally delayed or scheduled
/// for a specific time, grouped by queue name (spec.md §6).
#[async_trait]
pub trait AsyncQueue: Send + Sync {
    async fn enqueue_async(&self, name: &str, payload: serde_json::Value, group: &str) -> anyhow::Result<()>;
    async fn schedule_single(
        &self,
        at: DateTime<Utc>,
        name: &str,
        payload: serde_json::Value,
        group: &str,
    ) -> anyhow::Result<()>;
}

/// Extensibility hook for resolving the transport actually used, overriding
/// the entry's own `transport` column (spec.md §4.6: "Resolve effective_transport
/// via an extensibility hook").
pub trait TransportResolver: Send + Sync {
    fn resolve(&self, entry: &OutboxEntry) -> Transport {
        entry.transport
    }
}

/// The default resolver: always use the entry's stored transport.
pub struct DefaultTransportResolver;
impl TransportResolver for DefaultTransportResolver {}

pub struct RouterConfig {
    pub route_large_payloads_to_external: bool,
    pub max_in_process_bytes: usize,
    pub default_group: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            route_large_payloads_to_external: false,
            max_in_process_bytes: 50_000,
            default_group: "default".to_string(),
        }
    }
}

/// Routes a claimed entry to either the external sink or the in-process
/// async queue (spec.md §4.6).
pub struct OutboxRouter {
    external: Option<Box<dyn ExternalSink>>,
    queue: Box<dyn AsyncQueue>,
    resolver: Box<dyn TransportResolver>,
    config: RouterConfig,
}

impl OutboxRouter {
    pub fn new(
        external: Option<Box<dyn ExternalSink>>,
        queue: Box<dyn AsyncQueue>,
        resolver: Box<dyn TransportResolver>,
        config: RouterConfig,
    ) -> Self {
        Self {
            external,
            queue,
            resolver,
            config,
        }
    }

    pub fn with_defaults(external: Option<Box<dyn ExternalSink>>, queue: Box<dyn AsyncQueue>) -> Self {
        Self::new(external, queue, Box::new(DefaultTransportResolver), RouterConfig::default())
    }
}

#[async_trait]
impl OutboxPublisher for OutboxRouter {
    async fn publish(&self, entry: &OutboxEntry, wrapped_payload: serde_json::Value) -> anyhow::Result<()> {
        let effective_transport = self.resolver.resolve(entry);
        let route_to_external = effective_transport == Transport::External
            || (self.config.route_large_payloads_to_external
                && entry.payload_bytes > self.config.max_in_process_bytes);

        if route_to_external {
            let handled = match &self.external {
                Some(sink) => sink.handle(entry, &wrapped_payload).await?,
                None => false,
            };
            if handled {
                return Ok(());
            }
            if effective_transport == Transport::External {
                anyhow::bail!(
                    "entry {} required the external transport but nothing handled it",
                    entry.event_id
                );
            }
            // Large-payload routing declined: fall through to the in-process queue.
        }

        let group = entry
            .queue
            .clone()
            .unwrap_or_else(|| self.config.default_group.clone());
        let job_name = format!("integration_{}", entry.integration_action);
        if entry.delay_seconds > 0 {
            let at = Utc::now() + chrono::Duration::seconds(entry.delay_seconds);
            self.queue
                .schedule_single(at, &job_name, wrapped_payload, &group)
                .await
        } else {
            self.queue.enqueue_async(&job_name, wrapped_payload, &group).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryOutboxStore, NewOutboxEntry, OutboxStore};
    use ddd_schemas::{MessageKind, TenantId};
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingQueue {
        enqueued: Mutex<Vec<(String, String)>>,
        scheduled: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl AsyncQueue for RecordingQueue {
        async fn enqueue_async(&self, name: &str, _payload: serde_json::Value, group: &str) -> anyhow::Result<()> {
            self.enqueued.lock().unwrap().push((name.to_string(), group.to_string()));
            Ok(())
        }
        async fn schedule_single(
            &self,
            _at: DateTime<Utc>,
            name: &str,
            _payload: serde_json::Value,
            group: &str,
        ) -> anyhow::Result<()> {
            self.scheduled.lock().unwrap().push((name.to_string(), group.to_string()));
            Ok(())
        }
    }

    struct DecliningSink;
    #[async_trait]
    impl ExternalSink for DecliningSink {
        async fn handle(&self, _entry: &OutboxEntry, _wrapped: &serde_json::Value) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    async fn claimed_entry(store: &InMemoryOutboxStore, transport: Transport, queue: Option<&str>) -> OutboxEntry {
        let id = store
            .write(NewOutboxEntry {
                event_type: "X".into(),
                integration_action: "x.happened".into(),
                message_kind: MessageKind::Event,
                transport,
                queue: queue.map(|q| q.to_string()),
                payload: serde_json::json!({"a": 1}),
                correlation_id: Uuid::new_v4(),
                sequence: 0,
                command_id: None,
                delay_seconds: 0,
                is_unique: false,
                max_attempts: 5,
                blog_id: TenantId(1),
            })
            .await
            .unwrap();
        store.fetch_pending(10, "worker-a").await.unwrap();
        store.find_by_event_id(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn in_process_transport_enqueues_on_named_queue() {
        let store = InMemoryOutboxStore::new();
        let entry = claimed_entry(&store, Transport::InProcess, Some("billing")).await;
        let queue = RecordingQueue::default();
        let router = OutboxRouter::with_defaults(None, Box::new(queue));
        router.publish(&entry, serde_json::json!({"a": 1})).await.unwrap();
    }

    #[tokio::test]
    async fn external_transport_without_sink_fails_publish() {
        let store = InMemoryOutboxStore::new();
        let entry = claimed_entry(&store, Transport::External, None).await;
        let queue = RecordingQueue::default();
        let router = OutboxRouter::with_defaults(None, Box::new(queue));
        let result = router.publish(&entry, serde_json::json!({"a": 1})).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn external_transport_declined_still_fails_when_required() {
        let store = InMemoryOutboxStore::new();
        let entry = claimed_entry(&store, Transport::External, None).await;
        let queue = RecordingQueue::default();
        let router = OutboxRouter::with_defaults(Some(Box::new(DecliningSink)), Box::new(queue));
        let result = router.publish(&entry, serde_json::json!({"a": 1})).await;
        assert!(result.is_err());
    }
}
