//! Settings types.
//!
//! Every struct uses `#[serde(rename_all = "camelCase", default)]` so a
//! settings file only needs to name the keys it overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use trench_core::logging::LogFormat;

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrenchSettings {
    /// HTTP listener.
    pub server: ServerSettings,
    /// Per-connection transport limits and liveness timing.
    pub connection: ConnectionSettings,
    /// Hub command loop sizing.
    pub hub: HubSettings,
    /// Token verification.
    pub auth: AuthSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl TrenchSettings {
    /// Reject combinations the runtime cannot honor.
    pub fn validate(&self) -> Result<()> {
        let c = &self.connection;
        if c.ping_interval_ms >= c.pong_wait_ms {
            return Err(SettingsError::InvalidValue(format!(
                "connection.pingIntervalMs ({}) must be less than connection.pongWaitMs ({})",
                c.ping_interval_ms, c.pong_wait_ms
            )));
        }
        if c.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "connection.sendQueueCapacity must be at least 1".into(),
            ));
        }
        if c.max_message_size == 0 {
            return Err(SettingsError::InvalidValue(
                "connection.maxMessageSize must be at least 1".into(),
            ));
        }
        if self.hub.command_capacity == 0 || self.hub.presence_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "hub capacities must be at least 1".into(),
            ));
        }
        if self.auth.jwt_secret.is_empty() {
            return Err(SettingsError::InvalidValue("auth.jwtSecret is empty".into()));
        }
        Ok(())
    }
}

/// HTTP listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// Maximum concurrent WebSocket connections; further upgrades get `503`.
    pub max_connections: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 10_000,
        }
    }
}

/// Per-connection transport settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// Bounded outbound queue length. A full queue disconnects the peer.
    pub send_queue_capacity: usize,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,
    /// Idle read deadline measured from the last pong.
    pub pong_wait_ms: u64,
    /// Ping period. Must be shorter than `pong_wait_ms`.
    pub ping_interval_ms: u64,
    /// Upper bound on a single socket write.
    pub write_wait_ms: u64,
    /// Join already-queued frames with `\n` into one physical write.
    pub coalesce_frames: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            send_queue_capacity: 256,
            max_message_size: 65_536,
            pong_wait_ms: 60_000,
            ping_interval_ms: 54_000,
            write_wait_ms: 10_000,
            coalesce_frames: false,
        }
    }
}

impl ConnectionSettings {
    /// Idle read deadline.
    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms)
    }

    /// Ping period.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Write timeout.
    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }
}

/// Hub sizing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubSettings {
    /// Bounded command channel length.
    pub command_capacity: usize,
    /// Presence broadcast channel length (lagging subscribers skip events).
    pub presence_capacity: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            command_capacity: 256,
            presence_capacity: 64,
        }
    }
}

/// Placeholder secret shipped in the defaults. Never valid for deployment.
pub const DEFAULT_JWT_SECRET: &str = "change-me-in-production";

/// Token verification settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// HS256 shared secret.
    pub jwt_secret: String,
    /// Required `iss` claim, if set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: DEFAULT_JWT_SECRET.to_string(),
            issuer: None,
        }
    }
}

impl AuthSettings {
    /// Whether the secret is still the shipped placeholder.
    pub fn uses_default_secret(&self) -> bool {
        self.jwt_secret == DEFAULT_JWT_SECRET
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Line format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}
