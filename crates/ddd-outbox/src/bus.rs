//! Adapts an [`OutboxStore`] to the [`ddd_events::IntegrationEventBus`] contract (C2 + C4 wiring).

use std::sync::Arc;

use async_trait::async_trait;
use ddd_correlation::CorrelationContext;
use ddd_events::{IntegrationEventBus, IntegrationEventRecord};
use ddd_schemas::TenantId;
use uuid::Uuid;

use crate::store::{NewOutboxEntry, OutboxStore};

/// The default integration event bus: writes to the outbox inside the
/// current transaction (spec.md §4.2's "the default bus writes to the
/// outbox inside the current transaction").
pub struct OutboxBus {
    store: Arc<dyn OutboxStore>,
    max_attempts: u32,
    blog_id: TenantId,
}

impl OutboxBus {
    pub fn new(store: Arc<dyn OutboxStore>, max_attempts: u32, blog_id: TenantId) -> Self {
        Self {
            store,
            max_attempts,
            blog_id,
        }
    }
}

#[async_trait]
impl IntegrationEventBus for OutboxBus {
    async fn publish(
        &self,
        record: IntegrationEventRecord,
        ctx: &CorrelationContext,
    ) -> anyhow::Result<Uuid> {
        let sequence = ctx.next_sequence();
        self.store
            .write(NewOutboxEntry {
                event_type: record.event_type,
                integration_action: record.integration_action,
                message_kind: record.message_kind,
                transport: ddd_schemas::Transport::InProcess,
                queue: record.queue,
                payload: record.payload,
                correlation_id: ctx.get(),
                sequence,
                command_id: ctx.command_id(),
                delay_seconds: record.delay_seconds,
                is_unique: record.is_unique,
                max_attempts: self.max_attempts,
                blog_id: self.blog_id,
            })
            .await
    }

    async fn cancel_duplicates(&self, event_type: &str, payload_signature: &str) -> anyhow::Result<u64> {
        self.store.cancel_duplicates(event_type, payload_signature).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryOutboxStore;

    #[tokio::test]
    async fn publish_stamps_sequence_and_correlation_from_context() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let bus = OutboxBus::new(store.clone(), 5, TenantId(1));
        let ctx = CorrelationContext::with_id(Uuid::new_v4());

        let record = IntegrationEventRecord {
            event_type: "UserEarned".into(),
            integration_action: "user.earned".into(),
            payload: serde_json::json!({"user_id": 7}),
            delay_seconds: 0,
            is_unique: false,
            queue: None,
            message_kind: ddd_schemas::MessageKind::Event,
        };
        let event_id = bus.publish(record, &ctx).await.unwrap();
        let row = store.find_by_event_id(event_id).await.unwrap().unwrap();
        assert_eq!(row.correlation_id, ctx.get());
        assert_eq!(row.sequence, 0);
    }
}
