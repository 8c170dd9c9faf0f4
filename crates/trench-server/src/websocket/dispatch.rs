//! Inbound frame dispatch: decode, validate the envelope, route through the
//! [`MethodRegistry`], and decide whether anything goes back on the wire.

use metrics::counter;
use tracing::{debug, error, instrument, warn};

use crate::metrics::RPC_DROPPED_FRAMES_TOTAL;
use crate::rpc::codec::{DecodeError, decode_request, encode};
use crate::rpc::context::RpcContext;
use crate::rpc::errors::RpcError;
use crate::rpc::registry::MethodRegistry;
use crate::rpc::types::{JSONRPC_VERSION, RpcResponse};

/// Handle one inbound text frame.
///
/// Returns the serialized response to queue for the caller, or `None` when
/// nothing must be sent: the frame carried no usable id, or the request was
/// a notification (no id), in which case the handler still runs.
#[instrument(skip_all, fields(method))]
pub async fn handle_frame(
    frame: &str,
    registry: &MethodRegistry,
    ctx: &RpcContext,
) -> Option<String> {
    let request = match decode_request(frame) {
        Ok(request) => request,
        Err(DecodeError { id: Some(id), detail }) => {
            warn!(error = %detail, "malformed request");
            return reply(&RpcResponse::error(
                Some(id),
                &RpcError::Parse { message: detail },
            ));
        }
        Err(DecodeError { id: None, detail }) => {
            warn!(error = %detail, len = frame.len(), "dropping undecodable frame");
            counter!(RPC_DROPPED_FRAMES_TOTAL, "reason" => "malformed").increment(1);
            return None;
        }
    };

    let _ = tracing::Span::current().record("method", request.method.as_str());

    if request.jsonrpc != JSONRPC_VERSION {
        let Some(id) = request.id else {
            warn!(version = %request.jsonrpc, "dropping request with wrong version and no id");
            counter!(RPC_DROPPED_FRAMES_TOTAL, "reason" => "invalid_request").increment(1);
            return None;
        };
        return reply(&RpcResponse::error(
            Some(id),
            &RpcError::InvalidRequest {
                message: format!("unsupported jsonrpc version '{}'", request.jsonrpc),
            },
        ));
    }

    let wants_reply = request.id.is_some();
    debug!(id = ?request.id, "dispatching RPC");
    let response = registry.dispatch(request, ctx).await;
    if !wants_reply {
        return None;
    }
    reply(&response)
}

fn reply(response: &RpcResponse) -> Option<String> {
    match encode(response) {
        Ok(json) => Some(json),
        Err(e) => {
            error!(error = %e, "failed to serialize response");
            None
        }
    }
}
