//! JSON response bodies for the daemon's HTTP surface.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
    pub db_connected: bool,
    pub has_outbox_table: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboxCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dlq: u64,
    pub cancelled: u64,
    pub unresolved_dlq: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub daemon_uptime_secs: u64,
    pub outbox: OutboxCounts,
}
