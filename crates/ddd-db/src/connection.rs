//! Pool setup (spec.md Ambient Stack / database conventions), grounded on
//! `mqk_db::connect_from_env`.

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub const ENV_DB_URL: &str = "DDD_DATABASE_URL";

pub async fn connect_from_env() -> anyhow::Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_outbox_table: bool,
}

pub async fn status(pool: &PgPool) -> anyhow::Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema = 'public' and table_name = 'integration_outbox'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_outbox_table: exists,
    })
}
