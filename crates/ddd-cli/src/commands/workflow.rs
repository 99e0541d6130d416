use anyhow::{Context, Result};
use ddd_db::PgWorkflowRepository;
use ddd_workflow::WorkflowRepository;

pub async fn show(id: i64) -> Result<()> {
    let pool = super::connect().await?;
    let repo = PgWorkflowRepository::new(pool);
    let workflow = repo.get_by_id(id).await?.with_context(|| format!("no workflow with id {id}"))?;

    println!("id={}", id);
    println!("ref_id={}", workflow.ref_id);
    println!("ref_type={}", workflow.ref_type);
    println!("root_workflow_id={}", workflow.root_workflow_id.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string()));
    println!("current_idx={}/{}", workflow.current_idx, workflow.behaviour_configs.len());
    println!("current_phase={}", workflow.current_phase);
    println!("is_complete={}", workflow.is_complete);
    println!("is_failed={}", workflow.is_failed);
    println!("blog_id={}", workflow.blog_id);
    println!("created_at={}", workflow.created_at);
    println!("updated_at={}", workflow.updated_at);
    Ok(())
}
