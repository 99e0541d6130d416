use ddd_outbox::{BackoffPolicy, NewOutboxEntry, OutboxStore};
use ddd_schemas::{MessageKind, TenantId, Transport};
use uuid::Uuid;

fn new_entry() -> NewOutboxEntry {
    NewOutboxEntry {
        event_type: "OrderPlaced".to_string(),
        integration_action: "order.placed".to_string(),
        message_kind: MessageKind::Event,
        transport: Transport::InProcess,
        queue: None,
        payload: serde_json::json!({"order_id": 1}),
        correlation_id: Uuid::new_v4(),
        sequence: 0,
        command_id: None,
        delay_seconds: 0,
        is_unique: false,
        max_attempts: 5,
        blog_id: TenantId(1),
    }
}

#[tokio::test]
async fn claim_lock_prevents_double_dispatch_and_backoff_reschedules() -> anyhow::Result<()> {
    let url = match std::env::var(ddd_db::ENV_DB_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: {} not set", ddd_db::ENV_DB_URL);
            return Ok(());
        }
    };

    let pool = sqlx::postgres::PgPoolOptions::new().max_connections(2).connect(&url).await?;
    ddd_db::ensure_schema(&pool).await?;

    let store = ddd_db::PgOutboxStore::new(pool, std::time::Duration::from_secs(300));
    let event_id = store.write(new_entry()).await?;

    let claimed_a = store.fetch_pending(10, "worker-a").await?;
    assert_eq!(claimed_a.len(), 1);
    assert_eq!(claimed_a[0].event_id, event_id);

    let claimed_b = store.fetch_pending(10, "worker-b").await?;
    assert!(claimed_b.is_empty(), "a locked row must not be claimed twice");

    store.mark_failed(event_id, "broker unreachable", BackoffPolicy::default()).await?;
    let row = store.find_by_event_id(event_id).await?.unwrap();
    assert_eq!(row.attempts, 1);
    assert!(row.next_attempt_at.is_some());

    store.move_to_dlq(event_id).await?;
    let dlq = store.list_dlq().await?;
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].event_id, event_id);

    Ok(())
}
