//! Postgres-backed [`ProcessRepository`] (spec.md §4.7–§4.8, §4.15, C7/C14).

use anyhow::Context;
use async_trait::async_trait;
use ddd_process::{LongProcess, ProcessRepository};
use ddd_schemas::{ProcessStatus, TenantId};
use sqlx::{PgPool, Row};

pub struct PgProcessRepository {
    pool: PgPool,
}

impl PgProcessRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const PROCESS_COLUMNS: &str = "id, process_class, business_data, steps, step_name, status, waiting_for, \
     match_criteria, payload, correlation_id, last_error, created_at, updated_at, blog_id";

fn row_to_process(row: sqlx::postgres::PgRow) -> anyhow::Result<LongProcess> {
    let steps_json: serde_json::Value = row.try_get("steps")?;
    let payload_json: Option<serde_json::Value> = row.try_get("payload")?;
    Ok(LongProcess {
        id: Some(row.try_get("id")?),
        process_class: row.try_get("process_class")?,
        business_data: row.try_get("business_data")?,
        steps: serde_json::from_value(steps_json).context("corrupt long_processes.steps")?,
        step_name: row.try_get("step_name")?,
        status: ProcessStatus::parse(row.try_get::<String, _>("status")?.as_str())?,
        waiting_for: row.try_get("waiting_for")?,
        match_criteria: row.try_get("match_criteria")?,
        payload: payload_json.map(serde_json::from_value).transpose().context("corrupt long_processes.payload")?,
        correlation_id: row.try_get("correlation_id")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        blog_id: TenantId(row.try_get("blog_id")?),
    })
}

#[async_trait]
impl ProcessRepository for PgProcessRepository {
    async fn save(&self, process: &mut LongProcess) -> anyhow::Result<i64> {
        let steps_json = serde_json::to_value(&process.steps)?;
        let payload_json = process.payload.as_ref().map(serde_json::to_value).transpose()?;

        match process.id {
            None => {
                let row = sqlx::query(
                    r#"
                    insert into long_processes
                        (process_class, business_data, steps, step_name, status, waiting_for,
                         match_criteria, payload, correlation_id, last_error, created_at, updated_at, blog_id)
                    values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                    returning id
                    "#,
                )
                .bind(&process.process_class)
                .bind(&process.business_data)
                .bind(&steps_json)
                .bind(&process.step_name)
                .bind(process.status.as_str())
                .bind(&process.waiting_for)
                .bind(&process.match_criteria)
                .bind(&payload_json)
                .bind(process.correlation_id)
                .bind(&process.last_error)
                .bind(process.created_at)
                .bind(process.updated_at)
                .bind(process.blog_id.0)
                .fetch_one(&self.pool)
                .await
                .context("process insert failed")?;
                let id: i64 = row.try_get("id")?;
                process.id = Some(id);
                Ok(id)
            }
            Some(id) => {
                sqlx::query(
                    r#"
                    update long_processes
                       set business_data = $2, steps = $3, step_name = $4, status = $5, waiting_for = $6,
                           match_criteria = $7, payload = $8, last_error = $9, updated_at = $10
                     where id = $1
                    "#,
                )
                .bind(id)
                .bind(&process.business_data)
                .bind(&steps_json)
                .bind(&process.step_name)
                .bind(process.status.as_str())
                .bind(&process.waiting_for)
                .bind(&process.match_criteria)
                .bind(&payload_json)
                .bind(&process.last_error)
                .bind(process.updated_at)
                .execute(&self.pool)
                .await
                .context("process update failed")?;
                Ok(id)
            }
        }
    }

    async fn find(&self, id: i64) -> anyhow::Result<Option<LongProcess>> {
        let query = format!("select {PROCESS_COLUMNS} from long_processes where id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("process find failed")?;
        row.map(row_to_process).transpose()
    }

    async fn find_waiting_for(&self, event_class: &str) -> anyhow::Result<Vec<LongProcess>> {
        let query = format!(
            "select {PROCESS_COLUMNS} from long_processes where waiting_for = $1 and status = 'suspended'"
        );
        let rows = sqlx::query(&query)
            .bind(event_class)
            .fetch_all(&self.pool)
            .await
            .context("process find_waiting_for failed")?;
        rows.into_iter().map(row_to_process).collect()
    }

    async fn delete(&self, id: i64) -> anyhow::Result<()> {
        sqlx::query("delete from long_processes where id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("process delete failed")?;
        Ok(())
    }
}
