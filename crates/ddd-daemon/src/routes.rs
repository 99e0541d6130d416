//! Axum router and handlers for ddd-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. Handlers are `pub(crate)` so tests can compose the
//! router directly with `tower::ServiceExt::oneshot`.

use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use ddd_config::Settings;
use ddd_db::PgOutboxStore;
use ddd_outbox::OutboxStore;

use crate::{
    api_types::{HealthResponse, OutboxCounts, StatusResponse},
    state::{uptime_secs, AppState},
};

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v1/status", get(status_handler))
        .with_state(state)
}

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let db = ddd_db::status(&st.pool).await;
    let (db_connected, has_outbox_table) = match &db {
        Ok(s) => (s.ok, s.has_outbox_table),
        Err(_) => (false, false),
    };

    let code = if db_connected { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        code,
        Json(HealthResponse {
            ok: db_connected,
            service: st.build.service,
            version: st.build.version,
            db_connected,
            has_outbox_table,
        }),
    )
}

pub(crate) async fn status_handler(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let lock_timeout = Duration::from_secs(Settings::default().outbox.lock_timeout_seconds);
    let store = PgOutboxStore::new(st.pool.clone(), lock_timeout);

    match store.get_stats().await {
        Ok(stats) => (
            StatusCode::OK,
            Json(StatusResponse {
                service: st.build.service,
                version: st.build.version,
                daemon_uptime_secs: uptime_secs(),
                outbox: OutboxCounts {
                    pending: stats.pending,
                    processing: stats.processing,
                    completed: stats.completed,
                    failed: stats.failed,
                    dlq: stats.dlq,
                    cancelled: stats.cancelled,
                    unresolved_dlq: stats.unresolved_dlq,
                },
            }),
        )
            .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "status query failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}
