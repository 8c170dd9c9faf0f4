//! `name → handler` table and the timed call into it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::metrics::{RPC_ERRORS_TOTAL, RPC_REQUEST_DURATION_SECONDS, RPC_REQUESTS_TOTAL};
use crate::rpc::context::RpcContext;
use crate::rpc::errors::RpcError;
use crate::rpc::types::{RpcRequest, RpcResponse};

/// One JSON-RPC method.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Run the method for the connection in `ctx`. `params` is the raw
    /// request field; `None` when the client omitted it.
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError>;
}

/// Methods callable over a connection, looked up by exact name.
pub struct MethodRegistry {
    handlers: HashMap<&'static str, Arc<dyn MethodHandler>>,
}

fn count_error(method: &str, kind: &'static str) {
    counter!(RPC_ERRORS_TOTAL, "method" => method.to_owned(), "error_type" => kind).increment(1);
}

impl MethodRegistry {
    /// Budget for one handler call; exceeding it yields `INTERNAL_ERROR`.
    pub const HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

    const SLOW_REQUEST: Duration = Duration::from_secs(5);

    /// An empty table.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Bind `method` to `handler`, replacing any earlier binding.
    pub fn register(&mut self, method: &'static str, handler: impl MethodHandler + 'static) {
        let _ = self.handlers.insert(method, Arc::new(handler));
    }

    /// Resolve and run the request's method, keyed to the request id.
    ///
    /// Version checks and notification suppression happen before this in
    /// the dispatcher.
    pub async fn dispatch(&self, request: RpcRequest, ctx: &RpcContext) -> RpcResponse {
        let RpcRequest {
            method, params, id, ..
        } = request;
        counter!(RPC_REQUESTS_TOTAL, "method" => method.clone()).increment(1);

        let Some(handler) = self.handlers.get(method.as_str()).cloned() else {
            debug!(%method, "unknown method");
            let err = RpcError::MethodNotFound {
                method: method.clone(),
            };
            count_error(&method, err.kind());
            return RpcResponse::error(id, &err);
        };

        let started = tokio::time::Instant::now();
        let outcome = tokio::time::timeout(Self::HANDLER_TIMEOUT, handler.handle(params, ctx)).await;
        let elapsed = started.elapsed();
        histogram!(RPC_REQUEST_DURATION_SECONDS, "method" => method.clone())
            .record(elapsed.as_secs_f64());
        if elapsed >= Self::SLOW_REQUEST {
            warn!(%method, elapsed_ms = elapsed.as_millis(), "slow RPC request");
        }

        match outcome {
            Ok(Ok(result)) => RpcResponse::success(id, result),
            Ok(Err(err)) => {
                count_error(&method, err.kind());
                RpcResponse::error(id, &err)
            }
            Err(_) => {
                count_error(&method, "timeout");
                error!(%method, limit = ?Self::HANDLER_TIMEOUT, "RPC handler timed out");
                let err = RpcError::internal(format!("handler for '{method}' timed out"));
                RpcResponse::error(id, &err)
            }
        }
    }

    /// Registered names, sorted.
    pub fn methods(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Whether `method` is bound. Names are case-sensitive.
    pub fn has_method(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::errors::{INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND};
    use crate::rpc::handlers::test_helpers::make_test_context;
    use crate::rpc::types::RpcId;
    use serde_json::json;

    /// Replies with the caller's user id and whatever params arrived.
    struct WhoAmI;

    #[async_trait]
    impl MethodHandler for WhoAmI {
        async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
            Ok(json!({ "userId": ctx.user_id(), "params": params }))
        }
    }

    struct Rejects(fn() -> RpcError);

    #[async_trait]
    impl MethodHandler for Rejects {
        async fn handle(&self, _: Option<Value>, _: &RpcContext) -> Result<Value, RpcError> {
            Err((self.0)())
        }
    }

    struct Stalls(Duration);

    #[async_trait]
    impl MethodHandler for Stalls {
        async fn handle(&self, _: Option<Value>, _: &RpcContext) -> Result<Value, RpcError> {
            tokio::time::sleep(self.0).await;
            Ok(json!({ "success": true }))
        }
    }

    fn request(id: i64, method: &str, params: Option<Value>) -> RpcRequest {
        RpcRequest::new(method, params, Some(RpcId::from(id)))
    }

    #[tokio::test]
    async fn handler_sees_the_calling_connection() {
        let t = make_test_context().await;
        let mut registry = MethodRegistry::new();
        registry.register("whoami", WhoAmI);

        let resp = registry
            .dispatch(request(1, "whoami", Some(json!({"x": 1}))), &t.ctx)
            .await;
        assert_eq!(resp.id, Some(RpcId::from(1)));
        let result = resp.result().unwrap();
        assert_eq!(result["userId"], json!(t.ctx.user_id()));
        assert_eq!(result["params"]["x"], 1);
    }

    #[tokio::test]
    async fn unknown_method_carries_name_in_data() {
        let t = make_test_context().await;
        let resp = MethodRegistry::new()
            .dispatch(request(5, "deleteEverything", None), &t.ctx)
            .await;

        let err = resp.error_body().unwrap();
        assert_eq!(err.code, METHOD_NOT_FOUND);
        assert_eq!(err.message, "Method not found");
        assert_eq!(err.data, Some(json!("deleteEverything")));
        assert_eq!(resp.id, Some(RpcId::from(5)));
    }

    #[tokio::test]
    async fn handler_errors_keep_their_code() {
        let t = make_test_context().await;
        let mut registry = MethodRegistry::new();
        registry.register("bad", Rejects(|| RpcError::invalid_params("'text' is required")));
        registry.register("broken", Rejects(|| RpcError::internal("store down")));

        let bad = registry.dispatch(request(1, "bad", None), &t.ctx).await;
        let bad = bad.error_body().unwrap();
        assert_eq!(bad.code, INVALID_PARAMS);
        assert_eq!(bad.data, Some(json!("'text' is required")));

        let broken = registry.dispatch(request(2, "broken", None), &t.ctx).await;
        assert_eq!(broken.error_body().unwrap().code, INTERNAL_ERROR);
    }

    #[test]
    fn methods_are_sorted_and_case_sensitive() {
        let mut registry = MethodRegistry::default();
        assert!(registry.methods().is_empty());
        registry.register("typing", WhoAmI);
        registry.register("markRead", WhoAmI);

        assert_eq!(registry.methods(), vec!["markRead", "typing"]);
        assert!(registry.has_method("typing"));
        assert!(!registry.has_method("Typing"));
    }

    #[tokio::test]
    async fn later_registration_wins() {
        let t = make_test_context().await;
        let mut registry = MethodRegistry::new();
        registry.register("typing", WhoAmI);
        registry.register("typing", Rejects(|| RpcError::internal("replaced")));

        let resp = registry.dispatch(request(1, "typing", None), &t.ctx).await;
        assert!(resp.error_body().is_some());
        assert_eq!(registry.methods().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_handler_times_out() {
        let t = make_test_context().await;
        let mut registry = MethodRegistry::new();
        registry.register("quick", Stalls(Duration::from_millis(5)));
        registry.register("stuck", Stalls(Duration::from_secs(120)));

        let quick = registry.dispatch(request(1, "quick", None), &t.ctx).await;
        assert_eq!(quick.result(), Some(&json!({"success": true})));

        let stuck = registry.dispatch(request(2, "stuck", None), &t.ctx).await;
        assert_eq!(stuck.id, Some(RpcId::from(2)));
        let err = stuck.error_body().unwrap();
        assert_eq!(err.code, INTERNAL_ERROR);
        assert_eq!(err.data, Some(json!("handler for 'stuck' timed out")));
    }
}
