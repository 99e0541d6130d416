//! S4: writing the same unique event twice before it is processed supersedes
//! the first row; only the second publishes (spec.md §8).

use ddd_outbox::{NewOutboxEntry, OutboxStore};
use ddd_schemas::{MessageKind, OutboxStatus, TenantId, Transport};
use ddd_testkit::Harness;
use uuid::Uuid;

fn unique_entry() -> NewOutboxEntry {
    NewOutboxEntry {
        event_type: "PriceChanged".into(),
        integration_action: "price.changed".into(),
        message_kind: MessageKind::Event,
        transport: Transport::InProcess,
        queue: None,
        payload: serde_json::json!({"sku": "X-1", "price": 10}),
        correlation_id: Uuid::new_v4(),
        sequence: 0,
        command_id: None,
        delay_seconds: 0,
        is_unique: true,
        max_attempts: 5,
        blog_id: TenantId(1),
    }
}

#[tokio::test]
async fn second_unique_write_supersedes_the_first_and_only_it_survives_to_publish() {
    let harness = Harness::new(TenantId(1), 5);

    let first = harness.store.write(unique_entry()).await.unwrap();
    harness.store.cancel_duplicates("PriceChanged", "sig").await.unwrap();
    let second = harness.store.write(unique_entry()).await.unwrap();

    let first_row = harness.store.find_by_event_id(first).await.unwrap().unwrap();
    let second_row = harness.store.find_by_event_id(second).await.unwrap().unwrap();
    assert_eq!(first_row.status, OutboxStatus::Cancelled);
    assert_eq!(second_row.status, OutboxStatus::Pending);

    let result = harness.tick().await.unwrap();
    assert_eq!(result.total, 1, "only the surviving row is claimed and published");
    assert_eq!(result.completed, 1);

    let enqueued = harness.queue.enqueued.lock().unwrap();
    assert_eq!(enqueued.len(), 1);
}
