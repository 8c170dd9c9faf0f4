//! JSON-RPC 2.0 envelope types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::RpcError;

/// Protocol version tag carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Correlation id. JSON-RPC allows strings and numbers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    /// Numeric id.
    Number(serde_json::Number),
    /// String id.
    String(String),
}

impl From<i64> for RpcId {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<&str> for RpcId {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

/// Inbound request. An absent (or `null`) id marks a notification-style call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Protocol version; must equal [`JSONRPC_VERSION`].
    pub jsonrpc: String,
    /// Method name.
    pub method: String,
    /// Opaque parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RpcId>,
}

impl RpcRequest {
    /// Build a 2.0 request.
    pub fn new(method: impl Into<String>, params: Option<Value>, id: Option<RpcId>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
            id,
        }
    }
}

/// Error object inside a response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    /// Numeric error code.
    pub code: i32,
    /// Canonical short message for the code.
    pub message: String,
    /// Details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Exactly one of `result` or `error`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcOutcome {
    /// Successful result payload.
    Result(Value),
    /// Failure.
    Error(RpcErrorBody),
}

/// Outbound response, keyed to the request id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Protocol version.
    pub jsonrpc: String,
    /// Result or error.
    #[serde(flatten)]
    pub outcome: RpcOutcome,
    /// Echoed correlation id (`null` when it could not be recovered).
    pub id: Option<RpcId>,
}

impl RpcResponse {
    /// Successful response.
    pub fn success(id: Option<RpcId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            outcome: RpcOutcome::Result(result),
            id,
        }
    }

    /// Error response.
    pub fn error(id: Option<RpcId>, err: &RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            outcome: RpcOutcome::Error(err.to_error_body()),
            id,
        }
    }

    /// The result payload, if successful.
    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            RpcOutcome::Result(v) => Some(v),
            RpcOutcome::Error(_) => None,
        }
    }

    /// The error body, if failed.
    pub fn error_body(&self) -> Option<&RpcErrorBody> {
        match &self.outcome {
            RpcOutcome::Result(_) => None,
            RpcOutcome::Error(e) => Some(e),
        }
    }
}

/// Server-to-client push. Never carries an id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcNotification {
    /// Protocol version.
    pub jsonrpc: String,
    /// Event name.
    pub method: String,
    /// Event payload.
    pub params: Value,
}

impl RpcNotification {
    /// Build a 2.0 notification.
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
        }
    }
}
