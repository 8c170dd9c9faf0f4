//! RPC error taxonomy and JSON-RPC error codes.

use serde_json::Value;
use thiserror::Error;
use trench_store::StoreError;

use super::types::RpcErrorBody;

/// Invalid JSON or an envelope of the wrong shape.
pub const PARSE_ERROR: i32 = -32700;
/// Not a valid request object (e.g. wrong protocol version).
pub const INVALID_REQUEST: i32 = -32600;
/// No handler registered for the method.
pub const METHOD_NOT_FOUND: i32 = -32601;
/// Parameters missing or malformed.
pub const INVALID_PARAMS: i32 = -32602;
/// Handler or store failure.
pub const INTERNAL_ERROR: i32 = -32603;

/// Errors surfaced to the caller as a JSON-RPC error object.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Frame could not be decoded as a request.
    #[error("Parse error: {message}")]
    Parse {
        /// Decoder detail.
        message: String,
    },
    /// Request object is not acceptable.
    #[error("Invalid Request: {message}")]
    InvalidRequest {
        /// What was wrong.
        message: String,
    },
    /// Method is not registered.
    #[error("Method not found: {method}")]
    MethodNotFound {
        /// The requested method name.
        method: String,
    },
    /// Parameters failed validation.
    #[error("Invalid params: {message}")]
    InvalidParams {
        /// What was wrong.
        message: String,
    },
    /// Anything else, including store failures and authorization refusals.
    #[error("Internal error: {message}")]
    Internal {
        /// Detail passed through in `data`.
        message: String,
    },
}

impl RpcError {
    /// Numeric JSON-RPC error code.
    pub fn code(&self) -> i32 {
        match self {
            Self::Parse { .. } => PARSE_ERROR,
            Self::InvalidRequest { .. } => INVALID_REQUEST,
            Self::MethodNotFound { .. } => METHOD_NOT_FOUND,
            Self::InvalidParams { .. } => INVALID_PARAMS,
            Self::Internal { .. } => INTERNAL_ERROR,
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "parse_error",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::MethodNotFound { .. } => "method_not_found",
            Self::InvalidParams { .. } => "invalid_params",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Canonical message for the code. Details travel in `data`.
    pub fn canonical_message(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "Parse error",
            Self::InvalidRequest { .. } => "Invalid Request",
            Self::MethodNotFound { .. } => "Method not found",
            Self::InvalidParams { .. } => "Invalid params",
            Self::Internal { .. } => "Internal error",
        }
    }

    /// Build the wire error object.
    pub fn to_error_body(&self) -> RpcErrorBody {
        let detail = match self {
            Self::Parse { message }
            | Self::InvalidRequest { message }
            | Self::InvalidParams { message }
            | Self::Internal { message } => message,
            Self::MethodNotFound { method } => method,
        };
        RpcErrorBody {
            code: self.code(),
            message: self.canonical_message().to_owned(),
            data: (!detail.is_empty()).then(|| Value::String(detail.clone())),
        }
    }

    /// Shorthand for [`RpcError::InvalidParams`].
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
        }
    }

    /// Shorthand for [`RpcError::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<StoreError> for RpcError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidInput(message) => Self::InvalidParams { message },
            other => Self::Internal {
                message: other.to_string(),
            },
        }
    }
}
