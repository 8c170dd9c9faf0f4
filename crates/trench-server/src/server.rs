//! `TrenchServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use trench_store::MessageStore;

use crate::auth::IdentityProvider;
use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::health::HealthResponse;
use crate::metrics::WS_REJECTED_TOTAL;
use crate::rpc::registry::MethodRegistry;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::hub::Hub;
use crate::websocket::presence::PresenceBridge;
use crate::websocket::session::{SessionConfig, run_ws_session};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connection hub.
    pub hub: Hub,
    /// RPC method registry.
    pub registry: Arc<MethodRegistry>,
    /// Message persistence.
    pub store: Arc<dyn MessageStore>,
    /// Upgrade authentication.
    pub identity: Arc<dyn IdentityProvider>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// Connection cap.
    pub max_connections: usize,
    /// Per-connection transport settings.
    pub session: SessionConfig,
}

/// The chat server: owns the hub actor and the presence bridge, and serves
/// `/ws`, `/health`, and `/metrics`.
pub struct TrenchServer {
    config: ServerConfig,
    state: AppState,
    shutdown: ShutdownCoordinator,
    background: Vec<JoinHandle<()>>,
}

impl TrenchServer {
    /// Create the server and spawn its background tasks on the current
    /// runtime.
    pub fn new(
        config: ServerConfig,
        registry: MethodRegistry,
        store: Arc<dyn MessageStore>,
        identity: Arc<dyn IdentityProvider>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let shutdown = ShutdownCoordinator::new();
        let (hub, hub_task) = Hub::spawn(config.hub, shutdown.token());
        let bridge = PresenceBridge::new(hub.clone(), store.clone());
        let bridge_task = tokio::spawn(bridge.run(shutdown.token()));

        let state = AppState {
            hub,
            registry: Arc::new(registry),
            store,
            identity,
            start_time: Instant::now(),
            metrics,
            max_connections: config.max_connections,
            session: config.session,
        };
        Self {
            config,
            state,
            shutdown,
            background: vec![hub_task, bridge_task],
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();

        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "server error");
            }
        });
        info!(%addr, "trench server listening");
        Ok((addr, handle))
    }

    /// The hub handle.
    pub fn hub(&self) -> &Hub {
        &self.state.hub
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the method registry.
    pub fn registry(&self) -> &Arc<MethodRegistry> {
        &self.state.registry
    }

    /// Hand over the hub and presence tasks for a bounded shutdown wait.
    pub fn take_background_tasks(&mut self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut self.background)
    }
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// GET /ws
async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(user_id) = state.identity.authenticate(&headers, query.token.as_deref()) else {
        counter!(WS_REJECTED_TOTAL, "reason" => "unauthorized").increment(1);
        return StatusCode::UNAUTHORIZED.into_response();
    };
    if state.hub.connection_count() >= state.max_connections {
        warn!(max = state.max_connections, "connection limit reached");
        counter!(WS_REJECTED_TOTAL, "reason" => "capacity").increment(1);
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let AppState {
        hub,
        registry,
        store,
        session,
        ..
    } = state;
    ws.max_message_size(session.max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, user_id, registry, hub, store, session))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse::snapshot(state.start_time.elapsed(), &state.hub))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            crate::metrics::render(handle),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
