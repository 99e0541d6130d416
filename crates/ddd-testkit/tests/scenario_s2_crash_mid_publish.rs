//! S2: a row held by one worker cannot be claimed by a second worker while
//! the lock is live (spec.md §8). The other half of S2 — that a stale lock
//! left behind by a crashed worker is released and reclaimable — is proven
//! in `ddd-outbox`'s own store tests, the only place with access to mutate
//! `locked_until` directly into the past.

use ddd_outbox::{NewOutboxEntry, OutboxStore};
use ddd_schemas::{MessageKind, TenantId, Transport};
use ddd_testkit::Harness;
use uuid::Uuid;

#[tokio::test]
async fn a_locked_row_is_invisible_to_a_second_worker() {
    let harness = Harness::new(TenantId(1), 5);
    harness
        .store
        .write(NewOutboxEntry {
            event_type: "UserEarned".into(),
            integration_action: "user.earned".into(),
            message_kind: MessageKind::Event,
            transport: Transport::InProcess,
            queue: None,
            payload: serde_json::json!({"user_id": 7, "amount": 5}),
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

    let claimed_a = harness.store.fetch_pending(10, "worker-a").await.unwrap();
    assert_eq!(claimed_a.len(), 1);

    let claimed_b = harness.store.fetch_pending(10, "worker-b").await.unwrap();
    assert!(claimed_b.is_empty(), "worker-b must not see a row worker-a already holds");
}
