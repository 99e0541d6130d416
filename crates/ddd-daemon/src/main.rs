//! ddd-daemon entry point.
//!
//! Intentionally thin: sets up tracing, connects the pool, wires middleware,
//! starts the HTTP server. Route handlers live in `routes.rs`, shared state
//! in `state.rs`.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use ddd_daemon::{routes, state};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let pool = ddd_db::connect_from_env().await?;
    ddd_db::ensure_schema(&pool).await?;

    let shared = Arc::new(state::AppState::new(pool));

    let app = routes::build_router(Arc::clone(&shared)).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8900)));
    info!("ddd-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("DDD_DAEMON_ADDR").ok()?.parse().ok()
}
