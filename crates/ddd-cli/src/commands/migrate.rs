use anyhow::Result;

pub async fn run() -> Result<()> {
    let pool = super::connect().await?;
    ddd_db::migrate(&pool).await?;
    tracing::info!("schema migration applied");
    println!("migrations_applied=true");
    Ok(())
}
