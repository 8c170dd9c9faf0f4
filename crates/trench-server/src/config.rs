//! Server configuration.

use trench_settings::TrenchSettings;

use crate::websocket::hub::HubConfig;
use crate::websocket::session::SessionConfig;

/// Runtime configuration for [`TrenchServer`](crate::server::TrenchServer).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Per-connection transport settings.
    pub session: SessionConfig,
    /// Hub channel sizing.
    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 10_000,
            session: SessionConfig::default(),
            hub: HubConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Derive server configuration from loaded settings.
    pub fn from_settings(settings: &TrenchSettings) -> Self {
        let c = &settings.connection;
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_connections: settings.server.max_connections,
            session: SessionConfig {
                send_queue_capacity: c.send_queue_capacity,
                max_message_size: c.max_message_size,
                pong_wait: c.pong_wait(),
                ping_interval: c.ping_interval(),
                write_wait: c.write_wait(),
                coalesce_frames: c.coalesce_frames,
            },
            hub: HubConfig {
                command_capacity: settings.hub.command_capacity,
                presence_capacity: settings.hub.presence_capacity,
            },
        }
    }
}
