//! `/health` body.

use std::time::Duration;

use serde::Serialize;

use crate::websocket::hub::Hub;

/// Liveness snapshot served on `GET /health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `"ok"` whenever the process can answer.
    pub status: &'static str,
    /// Whole seconds since the server was built.
    pub uptime_secs: u64,
    /// Registered connections.
    pub connections: usize,
    /// Users with at least one registered connection.
    pub online_users: usize,
}

impl HealthResponse {
    /// Read the hub's counters. Never touches the actor.
    pub fn snapshot(uptime: Duration, hub: &Hub) -> Self {
        Self {
            status: "ok",
            uptime_secs: uptime.as_secs(),
            connections: hub.connection_count(),
            online_users: hub.online_user_count(),
        }
    }
}
