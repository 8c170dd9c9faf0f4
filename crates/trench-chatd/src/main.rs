//! # trench-chatd
//!
//! Chat daemon binary: loads settings, wires the store, the JWT identity
//! provider, and the RPC handlers into a `TrenchServer`, and serves until
//! ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use trench_server::auth::JwtIdentityProvider;
use trench_server::config::ServerConfig;
use trench_server::rpc::handlers::register_all;
use trench_server::rpc::registry::MethodRegistry;
use trench_server::server::TrenchServer;
use trench_settings::TrenchSettings;
use trench_store::MemoryStore;

/// Trench chat daemon.
#[derive(Parser, Debug)]
#[command(name = "trench-chatd", about = "Trench real-time chat server")]
struct Cli {
    /// Settings file (defaults to `~/.trench/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Log filter directive (overrides settings; `RUST_LOG` still wins).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn settings_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(trench_settings::settings_path)
    }

    /// Command-line flags take precedence over the file and environment.
    fn apply(&self, settings: &mut TrenchSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = cli.settings_path();
    let mut settings = trench_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);

    trench_core::logging::init_subscriber(&settings.logging.level, settings.logging.format);
    if settings.auth.uses_default_secret() {
        tracing::warn!(
            "auth.jwtSecret is the built-in placeholder, set TRENCH_JWT_SECRET before deploying"
        );
    }
    let metrics = trench_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let mut registry = MethodRegistry::new();
    register_all(&mut registry);
    let method_count = registry.methods().len();

    let identity = JwtIdentityProvider::new(
        &settings.auth.jwt_secret,
        settings.auth.issuer.as_deref(),
    );
    let mut server = TrenchServer::new(
        ServerConfig::from_settings(&settings),
        registry,
        Arc::new(MemoryStore::new()),
        Arc::new(identity),
        Some(metrics),
    );

    let (addr, handle) = server
        .listen()
        .await
        .context("Failed to bind server")?;
    tracing::info!(
        settings = %path.display(),
        "trench-chatd listening on ws://{addr}/ws ({method_count} RPC methods registered)"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    let mut tasks = server.take_background_tasks();
    tasks.push(handle);
    if server.shutdown().drain(tasks, None).await {
        tracing::info!("Shutdown complete");
    } else {
        tracing::warn!("Shutdown incomplete, exiting anyway");
    }
    Ok(())
}
