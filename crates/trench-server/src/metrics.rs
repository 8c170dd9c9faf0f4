//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Buckets for per-call RPC latency, in seconds.
const RPC_LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.025, 0.1, 0.5, 2.5, 10.0, 30.0];

/// Buckets for connection lifetimes, in seconds.
const CONNECTION_LIFETIME_BUCKETS: &[f64] = &[1.0, 10.0, 60.0, 300.0, 1800.0, 3600.0, 14_400.0];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(RPC_REQUEST_DURATION_SECONDS.to_owned()),
            RPC_LATENCY_BUCKETS,
        )?
        .set_buckets_for_metric(
            Matcher::Full(WS_CONNECTION_DURATION_SECONDS.to_owned()),
            CONNECTION_LIFETIME_BUCKETS,
        )
}

/// Install the process-wide Prometheus recorder and return the handle that
/// renders `/metrics`. Fails if a recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = builder()?.install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Prometheus text exposition.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// RPC requests total (counter, labels: method).
pub const RPC_REQUESTS_TOTAL: &str = "rpc_requests_total";
/// RPC errors total (counter, labels: method, error_type).
pub const RPC_ERRORS_TOTAL: &str = "rpc_errors_total";
/// RPC request duration seconds (histogram, labels: method).
pub const RPC_REQUEST_DURATION_SECONDS: &str = "rpc_request_duration_seconds";
/// Inbound frames dropped without a response (counter, labels: reason).
pub const RPC_DROPPED_FRAMES_TOTAL: &str = "rpc_dropped_frames_total";
/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket connection lifetime (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Connections evicted for outbound queue overflow (counter).
pub const WS_SEND_OVERFLOWS_TOTAL: &str = "ws_send_overflows_total";
/// Upgrades refused (counter, labels: reason).
pub const WS_REJECTED_TOTAL: &str = "ws_rejected_total";
/// Conversation broadcasts processed by the hub (counter).
pub const HUB_BROADCASTS_TOTAL: &str = "hub_broadcasts_total";
/// Presence edges (counter, labels: state).
pub const PRESENCE_TRANSITIONS_TOTAL: &str = "presence_transitions_total";
