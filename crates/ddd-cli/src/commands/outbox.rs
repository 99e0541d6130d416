use anyhow::Result;
use ddd_outbox::OutboxStore;

pub async fn stats() -> Result<()> {
    let pool = super::connect().await?;
    let store = super::outbox_store(pool);
    let stats = store.get_stats().await?;
    println!("pending={}", stats.pending);
    println!("processing={}", stats.processing);
    println!("completed={}", stats.completed);
    println!("failed={}", stats.failed);
    println!("dlq={}", stats.dlq);
    println!("cancelled={}", stats.cancelled);
    println!("unresolved_dlq={}", stats.unresolved_dlq);
    Ok(())
}

pub async fn purge(days: i64) -> Result<()> {
    let pool = super::connect().await?;
    let store = super::outbox_store(pool);
    let removed = store.purge_completed(days).await?;
    tracing::info!(removed, days, "outbox purge complete");
    println!("purged={removed}");
    Ok(())
}

pub async fn dlq_list() -> Result<()> {
    let pool = super::connect().await?;
    let store = super::outbox_store(pool);
    let entries = store.list_dlq().await?;
    if entries.is_empty() {
        println!("no unresolved dlq entries");
        return Ok(());
    }
    for entry in entries {
        println!(
            "event_id={} event_type={} attempts={} moved_at={} final_error={}",
            entry.event_id, entry.event_type, entry.attempts, entry.moved_at, entry.final_error
        );
    }
    Ok(())
}
