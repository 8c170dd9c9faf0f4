//! Chat handlers: sendMessage, getMessages, getConversations,
//! createConversation, markRead, typing, joinConversation, leaveConversation.
//!
//! State-changing handlers persist first, reply to the caller, and hand a
//! notification to the hub for fan-out to the conversation's joined
//! connections.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};
use trench_core::chat::{Conversation, NewAttachment};
use trench_core::ids::{ContractId, ConversationId, JobId, UserId};
use trench_store::{NewConversation, StoreError};

use crate::rpc::codec::encode;
use crate::rpc::context::RpcContext;
use crate::rpc::errors::RpcError;
use crate::rpc::registry::MethodHandler;
use crate::rpc::types::RpcNotification;
use crate::rpc::validation::{
    MAX_ATTACHMENTS, MAX_TEXT_LENGTH, page, parse_id, parse_params, validate_string_param,
};
use crate::websocket::connection::Frame;

/// Default page size for `getMessages`.
pub const DEFAULT_MESSAGES_LIMIT: usize = 50;
/// Default page size for `getConversations`.
pub const DEFAULT_CONVERSATIONS_LIMIT: usize = 20;

const NOT_A_PARTICIPANT: &str = "you are not a participant in this conversation";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationParams {
    conversation_id: String,
}

impl ConversationParams {
    fn id(&self) -> Result<ConversationId, RpcError> {
        parse_id(&self.conversation_id, "conversationId", ConversationId::parse)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageParams {
    conversation_id: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    attachments: Vec<NewAttachment>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetMessagesParams {
    conversation_id: String,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

#[derive(Deserialize)]
struct GetConversationsParams {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversationParams {
    participant_id: String,
    #[serde(default)]
    contract_id: Option<String>,
    #[serde(default)]
    job_id: Option<String>,
    #[serde(default)]
    initial_message: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingParams {
    conversation_id: String,
    is_typing: bool,
}

fn notification_frame(method: &str, params: Value) -> Result<Frame, RpcError> {
    let text = encode(&RpcNotification::new(method, params))
        .map_err(|e| RpcError::internal(format!("failed to encode {method}: {e}")))?;
    Ok(Frame::from(text))
}

/// Queue a notification for the conversation. The caller's side effect has
/// already been applied, so a stopped hub is logged rather than reported.
async fn fan_out(
    ctx: &RpcContext,
    conversation_id: &ConversationId,
    method: &str,
    params: Value,
    exclude_sender: bool,
) -> Result<(), RpcError> {
    let frame = notification_frame(method, params)?;
    if let Err(e) = ctx
        .hub
        .broadcast(
            conversation_id.clone(),
            ctx.user_id().clone(),
            frame,
            exclude_sender,
        )
        .await
    {
        warn!(%conversation_id, method, error = %e, "broadcast not queued");
    }
    Ok(())
}

fn with_presence(ctx: &RpcContext, mut conversation: Conversation) -> Conversation {
    for p in &mut conversation.participants {
        p.is_online = ctx.hub.is_user_online(&p.user_id);
    }
    conversation
}

async fn require_participant(
    ctx: &RpcContext,
    conversation_id: &ConversationId,
) -> Result<(), RpcError> {
    let (cid, uid) = (conversation_id.clone(), ctx.user_id().clone());
    let member = ctx.with_store(move |s| s.is_participant(&cid, &uid)).await?;
    if member {
        Ok(())
    } else {
        Err(StoreError::Forbidden(NOT_A_PARTICIPANT.into()).into())
    }
}

/// Persist a message and push `newMessage` to the other joined connections.
pub struct SendMessageHandler;

#[async_trait]
impl MethodHandler for SendMessageHandler {
    #[instrument(skip_all, fields(method = "sendMessage", user_id = %ctx.user_id()))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let p: SendMessageParams = parse_params(params)?;
        let conversation_id = parse_id(&p.conversation_id, "conversationId", ConversationId::parse)?;
        validate_string_param(&p.text, "text", MAX_TEXT_LENGTH)?;
        if p.attachments.len() > MAX_ATTACHMENTS {
            return Err(RpcError::invalid_params(format!(
                "at most {MAX_ATTACHMENTS} attachments per message"
            )));
        }

        let (cid, sender) = (conversation_id.clone(), ctx.user_id().clone());
        let message = ctx
            .with_store(move |s| s.create_message(&cid, &sender, &p.text, p.attachments))
            .await?;
        debug!(message_id = %message.id, %conversation_id, "message stored");

        let payload = serde_json::to_value(&message)
            .map_err(|e| RpcError::internal(format!("failed to encode message: {e}")))?;
        fan_out(
            ctx,
            &conversation_id,
            "newMessage",
            json!({ "message": payload }),
            true,
        )
        .await?;
        Ok(payload)
    }
}

/// Page through a conversation's history, newest first.
pub struct GetMessagesHandler;

#[async_trait]
impl MethodHandler for GetMessagesHandler {
    #[instrument(skip_all, fields(method = "getMessages", user_id = %ctx.user_id()))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let p: GetMessagesParams = parse_params(params)?;
        let conversation_id = parse_id(&p.conversation_id, "conversationId", ConversationId::parse)?;
        let window = page(p.limit, p.offset, DEFAULT_MESSAGES_LIMIT)?;

        let uid = ctx.user_id().clone();
        let (messages, total) = ctx
            .with_store(move |s| {
                if !s.is_participant(&conversation_id, &uid)? {
                    return Err(StoreError::Forbidden(NOT_A_PARTICIPANT.into()));
                }
                s.list_messages(&conversation_id, window)
            })
            .await?;
        Ok(json!({ "messages": messages, "total": total }))
    }
}

/// The caller's conversations with live presence filled in.
pub struct GetConversationsHandler;

#[async_trait]
impl MethodHandler for GetConversationsHandler {
    #[instrument(skip_all, fields(method = "getConversations", user_id = %ctx.user_id()))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let p: GetConversationsParams = parse_params(params)?;
        let window = page(p.limit, p.offset, DEFAULT_CONVERSATIONS_LIMIT)?;

        let uid = ctx.user_id().clone();
        let (conversations, total) = ctx
            .with_store(move |s| s.list_conversations(&uid, window))
            .await?;
        let conversations: Vec<Conversation> = conversations
            .into_iter()
            .map(|c| with_presence(ctx, c))
            .collect();
        Ok(json!({ "conversations": conversations, "total": total }))
    }
}

/// Open (or reuse) a two-party conversation.
pub struct CreateConversationHandler;

#[async_trait]
impl MethodHandler for CreateConversationHandler {
    #[instrument(skip_all, fields(method = "createConversation", user_id = %ctx.user_id()))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let p: CreateConversationParams = parse_params(params)?;
        let participant_id = parse_id(&p.participant_id, "participantId", UserId::parse)?;
        let contract_id = p
            .contract_id
            .as_deref()
            .map(|raw| parse_id(raw, "contractId", ContractId::parse))
            .transpose()?;
        let job_id = p
            .job_id
            .as_deref()
            .map(|raw| parse_id(raw, "jobId", JobId::parse))
            .transpose()?;
        if let Some(text) = &p.initial_message {
            validate_string_param(text, "initialMessage", MAX_TEXT_LENGTH)?;
        }

        let request = NewConversation {
            participant_id,
            contract_id,
            job_id,
            initial_message: p.initial_message,
        };
        let creator = ctx.user_id().clone();
        let conversation = ctx
            .with_store(move |s| s.get_or_create_conversation(&creator, request))
            .await?;
        Ok(json!(with_presence(ctx, conversation)))
    }
}

/// Move the caller's read marker and push `readReceipt` to every joined
/// connection, the caller's included.
pub struct MarkReadHandler;

#[async_trait]
impl MethodHandler for MarkReadHandler {
    #[instrument(skip_all, fields(method = "markRead", user_id = %ctx.user_id()))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let conversation_id = parse_params::<ConversationParams>(params)?.id()?;
        let (cid, uid) = (conversation_id.clone(), ctx.user_id().clone());
        let read_at = ctx.with_store(move |s| s.mark_read(&cid, &uid)).await?;

        fan_out(
            ctx,
            &conversation_id,
            "readReceipt",
            json!({
                "conversationId": conversation_id,
                "userId": ctx.user_id(),
                "readAt": read_at,
            }),
            false,
        )
        .await?;
        Ok(json!({ "success": true }))
    }
}

/// Relay a typing indicator. Nothing is stored.
pub struct TypingHandler;

#[async_trait]
impl MethodHandler for TypingHandler {
    #[instrument(skip_all, fields(method = "typing", user_id = %ctx.user_id()))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let p: TypingParams = parse_params(params)?;
        let conversation_id = parse_id(&p.conversation_id, "conversationId", ConversationId::parse)?;
        require_participant(ctx, &conversation_id).await?;

        fan_out(
            ctx,
            &conversation_id,
            "userTyping",
            json!({
                "conversationId": conversation_id,
                "userId": ctx.user_id(),
                "isTyping": p.is_typing,
            }),
            false,
        )
        .await?;
        Ok(json!({ "success": true }))
    }
}

/// Subscribe the calling connection to a conversation's broadcasts.
pub struct JoinConversationHandler;

#[async_trait]
impl MethodHandler for JoinConversationHandler {
    #[instrument(skip_all, fields(method = "joinConversation", user_id = %ctx.user_id()))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let conversation_id = parse_params::<ConversationParams>(params)?.id()?;
        let (cid, uid) = (conversation_id.clone(), ctx.user_id().clone());
        let conversation = ctx.with_store(move |s| s.get_conversation(&cid, &uid)).await?;

        let joined = ctx
            .hub
            .join(ctx.connection.clone(), conversation_id.clone())
            .await
            .map_err(|e| RpcError::internal(e.to_string()))?;
        if !joined {
            return Err(RpcError::internal("connection is closing"));
        }
        debug!(%conversation_id, connection_id = %ctx.connection.id, "joined conversation");
        Ok(json!({
            "success": true,
            "conversation": with_presence(ctx, conversation),
        }))
    }
}

/// Unsubscribe the calling connection from a conversation.
pub struct LeaveConversationHandler;

#[async_trait]
impl MethodHandler for LeaveConversationHandler {
    #[instrument(skip_all, fields(method = "leaveConversation", user_id = %ctx.user_id()))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let conversation_id = parse_params::<ConversationParams>(params)?.id()?;
        ctx.hub
            .leave(ctx.connection.clone(), conversation_id)
            .await
            .map_err(|e| RpcError::internal(e.to_string()))?;
        Ok(json!({ "success": true }))
    }
}
