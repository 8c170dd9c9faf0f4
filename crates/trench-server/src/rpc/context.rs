//! Per-connection context handed to every RPC handler.

use std::sync::Arc;

use trench_core::ids::UserId;
use trench_store::{MessageStore, StoreError};

use super::errors::RpcError;
use crate::websocket::connection::Connection;
use crate::websocket::hub::Hub;

/// What a handler can reach: the calling connection, the hub, and the store.
#[derive(Clone)]
pub struct RpcContext {
    /// The connection the request arrived on.
    pub connection: Arc<Connection>,
    /// Hub handle for membership changes and fan-out.
    pub hub: Hub,
    /// Message persistence.
    pub store: Arc<dyn MessageStore>,
}

impl RpcContext {
    /// Bundle the handler dependencies for one connection.
    pub fn new(connection: Arc<Connection>, hub: Hub, store: Arc<dyn MessageStore>) -> Self {
        Self {
            connection,
            hub,
            store,
        }
    }

    /// The authenticated caller.
    pub fn user_id(&self) -> &UserId {
        self.connection.user_id()
    }

    /// Run a store call on the blocking pool.
    pub async fn with_store<T, F>(&self, f: F) -> Result<T, RpcError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn MessageStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| RpcError::internal(format!("store task failed: {e}")))?
            .map_err(RpcError::from)
    }
}
