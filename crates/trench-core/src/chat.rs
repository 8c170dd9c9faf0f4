//! Chat domain types shared by the store and the wire layer.
//!
//! All types serialize in camelCase, which is also the wire format of the
//! JSON-RPC results and notifications carrying them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AttachmentId, ContractId, ConversationId, JobId, MessageId, UserId};

/// Kind of a chat message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Free text typed by a participant.
    #[default]
    Text,
}

/// File attached to a message. The bytes live elsewhere; only metadata is kept.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Attachment ID.
    pub id: AttachmentId,
    /// Original file name.
    pub file_name: String,
    /// Download URL.
    pub url: String,
    /// MIME type, if the uploader supplied one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    /// Size in bytes, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

/// Attachment metadata as submitted by a client, before an ID is assigned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAttachment {
    /// Original file name.
    pub file_name: String,
    /// Download URL.
    pub url: String,
    /// MIME type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    /// Size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

impl NewAttachment {
    /// Assign a fresh ID.
    pub fn into_attachment(self) -> Attachment {
        Attachment {
            id: AttachmentId::new(),
            file_name: self.file_name,
            url: self.url,
            file_type: self.file_type,
            file_size: self.file_size,
        }
    }
}

/// A persisted chat message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Message ID.
    pub id: MessageId,
    /// Conversation the message belongs to.
    pub conversation_id: ConversationId,
    /// Author.
    pub sender_id: UserId,
    /// Body text (may be empty when attachments are present).
    pub text: String,
    /// Message kind.
    pub message_type: MessageType,
    /// Attachments, in submission order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// Whether the message was edited after sending.
    pub is_edited: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// One participant of a conversation, as seen by the caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// Participant user.
    pub user_id: UserId,
    /// When this participant last marked the conversation read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_read_at: Option<DateTime<Utc>>,
    /// Live presence, filled in from the hub at read time.
    pub is_online: bool,
}

/// A conversation, enriched for one viewing user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Conversation ID.
    pub id: ConversationId,
    /// Participants (always at least the viewer).
    pub participants: Vec<Participant>,
    /// Contract the conversation is bound to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_id: Option<ContractId>,
    /// Job the conversation is bound to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    /// Most recent message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
    /// Messages from other participants newer than the viewer's read marker.
    pub unread_count: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last message (or creation).
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// IDs of every participant.
    pub fn participant_ids(&self) -> impl Iterator<Item = &UserId> {
        self.participants.iter().map(|p| &p.user_id)
    }
}
