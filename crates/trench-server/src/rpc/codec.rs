//! Pure encode/decode of envelopes.

use serde::Serialize;
use serde_json::Value;

use super::types::{RpcId, RpcNotification, RpcRequest, RpcResponse};

/// A frame that did not decode into an [`RpcRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeError {
    /// Correlation id recovered from a JSON object that was otherwise
    /// malformed. `None` when the frame was not JSON at all or carried no
    /// usable id.
    pub id: Option<RpcId>,
    /// Decoder message.
    pub detail: String,
}

/// Decode an inbound frame.
///
/// Version is not checked here; that is the dispatcher's job so the error
/// can be keyed to the id.
pub fn decode_request(frame: &str) -> Result<RpcRequest, DecodeError> {
    let value: Value = serde_json::from_str(frame).map_err(|e| DecodeError {
        id: None,
        detail: e.to_string(),
    })?;

    let id = value
        .get("id")
        .cloned()
        .and_then(|v| serde_json::from_value::<RpcId>(v).ok());

    serde_json::from_value(value).map_err(|e| DecodeError {
        id,
        detail: e.to_string(),
    })
}

/// Decode a response (client side and tests).
pub fn decode_response(frame: &str) -> serde_json::Result<RpcResponse> {
    serde_json::from_str(frame)
}

/// Decode a notification (client side and tests).
pub fn decode_notification(frame: &str) -> serde_json::Result<RpcNotification> {
    serde_json::from_str(frame)
}

/// Serialize any envelope to a text frame.
pub fn encode<T: Serialize>(envelope: &T) -> serde_json::Result<String> {
    serde_json::to_string(envelope)
}
