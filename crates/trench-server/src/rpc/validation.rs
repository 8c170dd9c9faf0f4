//! Input validation helpers for RPC parameters.

use serde::de::DeserializeOwned;
use serde_json::Value;
use trench_store::Page;

use super::errors::RpcError;

/// Maximum message body length (16 KB).
pub const MAX_TEXT_LENGTH: usize = 16_384;

/// Maximum attachments on one message.
pub const MAX_ATTACHMENTS: usize = 10;

/// Upper bound on any page size a client may request.
pub const MAX_PAGE_LIMIT: usize = 100;

/// Deserialize the params object into a typed struct.
///
/// A missing params member is treated as an empty object, so structs whose
/// fields are all optional accept it.
pub fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    let value = params.unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    serde_json::from_value(value).map_err(|e| RpcError::invalid_params(e.to_string()))
}

/// Parse a UUID-shaped id parameter.
pub fn parse_id<T>(raw: &str, name: &str, parse: impl FnOnce(&str) -> Option<T>) -> Result<T, RpcError> {
    parse(raw).ok_or_else(|| RpcError::invalid_params(format!("'{name}' must be a UUID")))
}

/// Validate that a string parameter does not exceed `max_len` bytes.
pub fn validate_string_param(value: &str, name: &str, max_len: usize) -> Result<(), RpcError> {
    if value.len() > max_len {
        return Err(RpcError::invalid_params(format!(
            "'{name}' exceeds maximum length ({} > {max_len})",
            value.len()
        )));
    }
    Ok(())
}

/// Build a page window, applying `default_limit` and clamping to
/// [`MAX_PAGE_LIMIT`]. A zero limit is rejected.
pub fn page(limit: Option<usize>, offset: Option<usize>, default_limit: usize) -> Result<Page, RpcError> {
    let limit = limit.unwrap_or(default_limit);
    if limit == 0 {
        return Err(RpcError::invalid_params("'limit' must be positive"));
    }
    Ok(Page::new(limit.min(MAX_PAGE_LIMIT), offset.unwrap_or(0)))
}
