pub mod migrate;
pub mod outbox;
pub mod process;
pub mod workflow;

use std::time::Duration;

use ddd_config::Settings;
use ddd_db::PgOutboxStore;
use sqlx::PgPool;

/// Every subcommand connects the same way, so the connection itself lives
/// here rather than being copy-pasted into each command.
pub(crate) async fn connect() -> anyhow::Result<PgPool> {
    ddd_db::connect_from_env().await
}

pub(crate) fn outbox_store(pool: PgPool) -> PgOutboxStore {
    let lock_timeout = Settings::default().outbox.lock_timeout_seconds;
    PgOutboxStore::new(pool, Duration::from_secs(lock_timeout))
}
