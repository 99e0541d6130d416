//! Postgres storage layer: idempotent schema plus the repository
//! implementations the outbox, long-process, workflow, and pipeline crates
//! depend on as abstract traits (spec.md §4.15, C14).

mod audit;
mod connection;
mod outbox;
mod process;
mod schema;
mod transaction;
mod workflow;

pub use audit::PgCommandAuditRepository;
pub use connection::{connect_from_env, status, DbStatus, ENV_DB_URL};
pub use outbox::PgOutboxStore;
pub use process::PgProcessRepository;
pub use schema::{ensure_schema, migrate};
pub use transaction::{PgTransaction, PgTransactionManager};
pub use workflow::{PgWorkItemRepository, PgWorkflowRepository};
