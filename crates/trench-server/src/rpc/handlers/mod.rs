//! RPC method handlers.

pub mod chat;

use crate::rpc::registry::MethodRegistry;

/// Register every chat method.
pub fn register_all(registry: &mut MethodRegistry) {
    registry.register("sendMessage", chat::SendMessageHandler);
    registry.register("getMessages", chat::GetMessagesHandler);
    registry.register("getConversations", chat::GetConversationsHandler);
    registry.register("createConversation", chat::CreateConversationHandler);
    registry.register("markRead", chat::MarkReadHandler);
    registry.register("typing", chat::TypingHandler);
    registry.register("joinConversation", chat::JoinConversationHandler);
    registry.register("leaveConversation", chat::LeaveConversationHandler);
}
