//! Postgres-backed [`TransactionManager`] (spec.md §4.12 step 3, C12), wired
//! into the pipeline's Transaction middleware.

use async_trait::async_trait;
use ddd_pipeline::{Transaction, TransactionManager};
use sqlx::{PgPool, Postgres};
use tokio::sync::Mutex;

pub struct PgTransactionManager {
    pool: PgPool,
}

impl PgTransactionManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// `commit`/`rollback` consume a `sqlx::Transaction` by value, but the
/// `Transaction` trait takes `&self` (the pipeline holds it as `Box<dyn
/// Transaction>` across a handler call); the inner transaction is parked in
/// an async mutex so either finishing method can take ownership of it once.
pub struct PgTransaction {
    inner: Mutex<Option<sqlx::Transaction<'static, Postgres>>>,
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn commit(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.lock().await.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn rollback(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.lock().await.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionManager for PgTransactionManager {
    async fn begin(&self) -> anyhow::Result<Box<dyn Transaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { inner: Mutex::new(Some(tx)) }))
    }
}
