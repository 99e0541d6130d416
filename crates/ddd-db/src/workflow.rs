//! Postgres-backed [`WorkflowRepository`]/[`WorkItemRepository`] (spec.md
//! §4.9–§4.11, §4.15, C9/C10/C14).

use anyhow::Context;
use async_trait::async_trait;
use ddd_schemas::{TenantId, WorkItemStatus};
use ddd_workflow::{BehaviourWorkflow, WorkItem, WorkItemList, WorkItemRepository, WorkflowRepository};
use sqlx::{PgPool, Row};

pub struct PgWorkflowRepository {
    pool: PgPool,
}

impl PgWorkflowRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const WORKFLOW_COLUMNS: &str = "id, ref_id, ref_type, root_workflow_id, behaviour_configs, behaviour_results, \
     current_idx, current_phase, is_complete, is_failed, meta, blog_id, created_at, updated_at";

fn row_to_workflow(row: sqlx::postgres::PgRow) -> anyhow::Result<BehaviourWorkflow> {
    let configs: serde_json::Value = row.try_get("behaviour_configs")?;
    let results: serde_json::Value = row.try_get("behaviour_results")?;
    let meta: serde_json::Value = row.try_get("meta")?;
    Ok(BehaviourWorkflow {
        id: Some(row.try_get("id")?),
        ref_id: row.try_get("ref_id")?,
        ref_type: row.try_get("ref_type")?,
        root_workflow_id: row.try_get("root_workflow_id")?,
        behaviour_configs: serde_json::from_value(configs).context("corrupt behaviour_workflows.behaviour_configs")?,
        behaviour_results: serde_json::from_value(results).context("corrupt behaviour_workflows.behaviour_results")?,
        current_idx: row.try_get::<i64, _>("current_idx")? as usize,
        current_phase: row.try_get::<i32, _>("current_phase")? as u32,
        is_complete: row.try_get("is_complete")?,
        is_failed: row.try_get("is_failed")?,
        meta: serde_json::from_value(meta).context("corrupt behaviour_workflows.meta")?,
        blog_id: TenantId(row.try_get("blog_id")?),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl WorkflowRepository for PgWorkflowRepository {
    async fn get_by_id(&self, id: i64) -> anyhow::Result<Option<BehaviourWorkflow>> {
        let query = format!("select {WORKFLOW_COLUMNS} from behaviour_workflows where id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("workflow get_by_id failed")?;
        row.map(row_to_workflow).transpose()
    }

    async fn get_by_ref_id(&self, ref_id: &str, ref_type: &str) -> anyhow::Result<Option<BehaviourWorkflow>> {
        let query = format!("select {WORKFLOW_COLUMNS} from behaviour_workflows where ref_id = $1 and ref_type = $2");
        let row = sqlx::query(&query)
            .bind(ref_id)
            .bind(ref_type)
            .fetch_optional(&self.pool)
            .await
            .context("workflow get_by_ref_id failed")?;
        row.map(row_to_workflow).transpose()
    }

    async fn save(&self, workflow: &mut BehaviourWorkflow) -> anyhow::Result<i64> {
        let configs = serde_json::to_value(&workflow.behaviour_configs)?;
        let results = serde_json::to_value(&workflow.behaviour_results)?;
        let meta = serde_json::to_value(&workflow.meta)?;

        match workflow.id {
            None => {
                let row = sqlx::query(
                    r#"
                    insert into behaviour_workflows
                        (ref_id, ref_type, root_workflow_id, behaviour_configs, behaviour_results,
                         current_idx, current_phase, is_complete, is_failed, meta, blog_id, created_at, updated_at)
                    values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                    returning id
                    "#,
                )
                .bind(&workflow.ref_id)
                .bind(&workflow.ref_type)
                .bind(workflow.root_workflow_id)
                .bind(&configs)
                .bind(&results)
                .bind(workflow.current_idx as i64)
                .bind(workflow.current_phase as i32)
                .bind(workflow.is_complete)
                .bind(workflow.is_failed)
                .bind(&meta)
                .bind(workflow.blog_id.0)
                .bind(workflow.created_at)
                .bind(workflow.updated_at)
                .fetch_one(&self.pool)
                .await
                .context("workflow insert failed")?;
                let id: i64 = row.try_get("id")?;
                workflow.id = Some(id);
                Ok(id)
            }
            Some(id) => {
                sqlx::query(
                    r#"
                    update behaviour_workflows
                       set behaviour_results = $2, current_idx = $3, current_phase = $4,
                           is_complete = $5, is_failed = $6, meta = $7, updated_at = $8
                     where id = $1
                    "#,
                )
                .bind(id)
                .bind(&results)
                .bind(workflow.current_idx as i64)
                .bind(workflow.current_phase as i32)
                .bind(workflow.is_complete)
                .bind(workflow.is_failed)
                .bind(&meta)
                .bind(workflow.updated_at)
                .execute(&self.pool)
                .await
                .context("workflow update failed")?;
                Ok(id)
            }
        }
    }
}

pub struct PgWorkItemRepository {
    pool: PgPool,
}

impl PgWorkItemRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const WORK_ITEM_COLUMNS: &str = "id, workflow_id, behaviour_idx, phase, item_key, status, attempts, \
     last_error, payload, blog_id, created_at, updated_at";

fn row_to_work_item(row: sqlx::postgres::PgRow) -> anyhow::Result<WorkItem> {
    let payload: Option<serde_json::Value> = row.try_get("payload")?;
    Ok(WorkItem {
        id: Some(row.try_get("id")?),
        workflow_id: row.try_get("workflow_id")?,
        behaviour_idx: row.try_get::<i64, _>("behaviour_idx")? as usize,
        phase: row.try_get::<i32, _>("phase")? as u32,
        item_key: row.try_get("item_key")?,
        status: WorkItemStatus::parse(row.try_get::<String, _>("status")?.as_str())?,
        attempts: row.try_get::<i32, _>("attempts")? as u32,
        last_error: row.try_get("last_error")?,
        payload: payload.map(serde_json::from_value).transpose().context("corrupt behaviour_workflow_items.payload")?,
        blog_id: TenantId(row.try_get("blog_id")?),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl WorkItemRepository for PgWorkItemRepository {
    async fn get_by_id(&self, id: i64) -> anyhow::Result<Option<WorkItem>> {
        let query = format!("select {WORK_ITEM_COLUMNS} from behaviour_workflow_items where id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("work item get_by_id failed")?;
        row.map(row_to_work_item).transpose()
    }

    async fn find_by_unique(
        &self,
        workflow_id: i64,
        behaviour_idx: usize,
        phase: u32,
        item_key: &str,
    ) -> anyhow::Result<Option<WorkItem>> {
        let query = format!(
            "select {WORK_ITEM_COLUMNS} from behaviour_workflow_items \
             where workflow_id = $1 and behaviour_idx = $2 and phase = $3 and item_key = $4"
        );
        let row = sqlx::query(&query)
            .bind(workflow_id)
            .bind(behaviour_idx as i64)
            .bind(phase as i32)
            .bind(item_key)
            .fetch_optional(&self.pool)
            .await
            .context("work item find_by_unique failed")?;
        row.map(row_to_work_item).transpose()
    }

    async fn get_for_step(&self, workflow_id: i64, behaviour_idx: usize, phase: u32) -> anyhow::Result<WorkItemList> {
        let query = format!(
            "select {WORK_ITEM_COLUMNS} from behaviour_workflow_items \
             where workflow_id = $1 and behaviour_idx = $2 and phase = $3 order by id asc"
        );
        let rows = sqlx::query(&query)
            .bind(workflow_id)
            .bind(behaviour_idx as i64)
            .bind(phase as i32)
            .fetch_all(&self.pool)
            .await
            .context("work item get_for_step failed")?;
        let items = rows.into_iter().map(row_to_work_item).collect::<anyhow::Result<Vec<_>>>()?;
        Ok(WorkItemList::new(items))
    }

    async fn save(&self, item: &mut WorkItem) -> anyhow::Result<i64> {
        let payload = item.payload.as_ref().map(serde_json::to_value).transpose()?;
        let row = sqlx::query(
            r#"
            insert into behaviour_workflow_items
                (workflow_id, behaviour_idx, phase, item_key, status, attempts, last_error,
                 payload, blog_id, created_at, updated_at)
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            on conflict (workflow_id, behaviour_idx, phase, item_key) do update
                set status = excluded.status,
                    attempts = excluded.attempts,
                    last_error = excluded.last_error,
                    payload = excluded.payload,
                    updated_at = excluded.updated_at
            returning id
            "#,
        )
        .bind(item.workflow_id)
        .bind(item.behaviour_idx as i64)
        .bind(item.phase as i32)
        .bind(&item.item_key)
        .bind(item.status.as_str())
        .bind(item.attempts as i32)
        .bind(&item.last_error)
        .bind(&payload)
        .bind(item.blog_id.0)
        .bind(item.created_at)
        .bind(item.updated_at)
        .fetch_one(&self.pool)
        .await
        .context("work item save failed")?;
        let id: i64 = row.try_get("id")?;
        item.id = Some(id);
        Ok(id)
    }
}
