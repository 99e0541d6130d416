use anyhow::{Context, Result};
use ddd_db::PgProcessRepository;
use ddd_process::ProcessRepository;

pub async fn show(id: i64) -> Result<()> {
    let pool = super::connect().await?;
    let repo = PgProcessRepository::new(pool);
    let process = repo.find(id).await?.with_context(|| format!("no process with id {id}"))?;

    println!("id={}", id);
    println!("process_class={}", process.process_class);
    println!("step_name={}", process.step_name);
    println!("status={:?}", process.status);
    println!("waiting_for={}", process.waiting_for.as_deref().unwrap_or("-"));
    println!("correlation_id={}", process.correlation_id);
    println!("blog_id={}", process.blog_id);
    println!("last_error={}", process.last_error.as_deref().unwrap_or("-"));
    println!("created_at={}", process.created_at);
    println!("updated_at={}", process.updated_at);
    Ok(())
}
