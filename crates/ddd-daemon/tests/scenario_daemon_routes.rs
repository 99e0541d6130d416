//! In-process scenario tests for ddd-daemon's HTTP endpoints.
//!
//! Each test calls `routes::build_router` and drives it via
//! `tower::ServiceExt::oneshot` — no TCP socket, no running binary. DB-backed
//! (the router reports on real outbox rows), so skipped if DDD_DATABASE_URL
//! is not set.

use std::sync::Arc;

use axum::http::{Request, StatusCode};
use ddd_daemon::{routes, state};
use http_body_util::BodyExt;
use tower::ServiceExt; // oneshot
use uuid::Uuid;

async fn make_router() -> Option<axum::Router> {
    let url = std::env::var(ddd_db::ENV_DB_URL).ok()?;
    let pool = sqlx::postgres::PgPoolOptions::new().max_connections(2).connect(&url).await.ok()?;
    ddd_db::ensure_schema(&pool).await.ok()?;
    let st = Arc::new(state::AppState::new(pool));
    Some(routes::build_router(st))
}

async fn call(router: axum::Router, req: Request<axum::body::Body>) -> (StatusCode, bytes::Bytes) {
    let resp = router.oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let body = resp.into_body().collect().await.expect("body collect failed").to_bytes();
    (status, body)
}

fn parse_json(b: bytes::Bytes) -> serde_json::Value {
    serde_json::from_slice(&b).expect("body is not valid JSON")
}

#[tokio::test]
async fn healthz_reports_db_connected_true() {
    let Some(router) = make_router().await else {
        eprintln!("SKIP: {} not set", ddd_db::ENV_DB_URL);
        return;
    };

    let req = Request::builder().method("GET").uri("/healthz").body(axum::body::Body::empty()).unwrap();
    let (status, body) = call(router, req).await;
    assert_eq!(status, StatusCode::OK);

    let json = parse_json(body);
    assert_eq!(json["ok"], true);
    assert_eq!(json["db_connected"], true);
    assert_eq!(json["service"], "ddd-daemon");
}

#[tokio::test]
async fn status_counts_a_freshly_written_pending_row() {
    let Some(router) = make_router().await else {
        eprintln!("SKIP: {} not set", ddd_db::ENV_DB_URL);
        return;
    };

    let url = std::env::var(ddd_db::ENV_DB_URL).unwrap();
    let pool = sqlx::postgres::PgPoolOptions::new().max_connections(2).connect(&url).await.unwrap();
    sqlx::query(
        r#"
        insert into integration_outbox
            (event_id, event_type, integration_action, message_kind, transport, correlation_id,
             sequence, payload, scheduled_at, blog_id)
        values ($1, 'TestDaemonEvent', 'test.daemon', 'event', 'in_process', $2, 0, '{}', now(), 1)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(Uuid::new_v4())
    .execute(&pool)
    .await
    .unwrap();

    let req = Request::builder().method("GET").uri("/v1/status").body(axum::body::Body::empty()).unwrap();
    let (status, body) = call(router, req).await;
    assert_eq!(status, StatusCode::OK);

    let json = parse_json(body);
    assert!(json["outbox"]["pending"].as_u64().unwrap() >= 1);
}
