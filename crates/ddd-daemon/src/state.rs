//! Shared state handed to every Axum handler.
//!
//! Unlike `mqk-daemon`'s `AppState` there is no control-plane to mutate here
//! (no run lifecycle, no integrity arm/disarm) — this daemon only ever
//! reports on the database it's pointed at, so the state is just the pool
//! plus static build metadata.

use std::sync::OnceLock;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub build: BuildInfo,
}

impl AppState {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            build: BuildInfo {
                service: "ddd-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
        }
    }
}

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_secs()
}
