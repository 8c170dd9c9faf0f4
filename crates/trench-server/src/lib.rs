//! # trench-server
//!
//! Real-time chat core over WebSockets.
//!
//! - `WebSocket` gateway: authenticated upgrade, per-connection inbound and
//!   outbound pumps, bounded outbound queues, Ping/Pong liveness
//! - Connection hub: a single actor owns user and conversation membership;
//!   presence reads go through a shared lock; conversation fan-out with an
//!   optional sender exclusion
//! - JSON-RPC 2.0 envelopes, dispatch, and the chat method handlers
//! - Presence notifications to conversation partners
//! - `/health` and Prometheus `/metrics`, graceful shutdown via
//!   `CancellationToken`

#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod rpc;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use server::TrenchServer;
