//! WebSocket transport: connections, hub, pumps, dispatch, presence.

pub mod connection;
pub mod dispatch;
pub mod hub;
pub mod presence;
pub mod session;
