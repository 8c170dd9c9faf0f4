//! In-memory [`MessageStore`].

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;
use trench_core::chat::{Conversation, Message, MessageType, NewAttachment, Participant};
use trench_core::ids::{ContractId, ConversationId, JobId, MessageId, UserId};

use crate::errors::{Result, StoreError};
use crate::{MessageStore, NewConversation, Page};

struct ParticipantRecord {
    user_id: UserId,
    last_read_at: Option<DateTime<Utc>>,
}

struct ConversationRecord {
    id: ConversationId,
    contract_id: Option<ContractId>,
    job_id: Option<JobId>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    participants: Vec<ParticipantRecord>,
    /// Oldest first.
    messages: Vec<Message>,
}

impl ConversationRecord {
    fn participant(&self, user_id: &UserId) -> Option<&ParticipantRecord> {
        self.participants.iter().find(|p| &p.user_id == user_id)
    }

    fn has(&self, user_id: &UserId) -> bool {
        self.participant(user_id).is_some()
    }

    fn push_message(
        &mut self,
        sender_id: &UserId,
        text: &str,
        attachments: Vec<NewAttachment>,
    ) -> Message {
        let message = Message {
            id: MessageId::new(),
            conversation_id: self.id.clone(),
            sender_id: sender_id.clone(),
            text: text.to_owned(),
            message_type: MessageType::Text,
            attachments: attachments
                .into_iter()
                .map(NewAttachment::into_attachment)
                .collect(),
            is_edited: false,
            created_at: Utc::now(),
        };
        self.updated_at = message.created_at;
        self.messages.push(message.clone());
        message
    }

    fn view(&self, viewer: &UserId) -> Conversation {
        let last_read = self.participant(viewer).and_then(|p| p.last_read_at);
        let unread = self
            .messages
            .iter()
            .filter(|m| &m.sender_id != viewer)
            .filter(|m| last_read.is_none_or(|t| m.created_at > t))
            .count();

        Conversation {
            id: self.id.clone(),
            participants: self
                .participants
                .iter()
                .map(|p| Participant {
                    user_id: p.user_id.clone(),
                    last_read_at: p.last_read_at,
                    is_online: false,
                })
                .collect(),
            contract_id: self.contract_id.clone(),
            job_id: self.job_id.clone(),
            last_message: self.messages.last().cloned(),
            unread_count: unread as u64,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Process-local store. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    conversations: RwLock<HashMap<ConversationId, ConversationRecord>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored conversations.
    pub fn conversation_count(&self) -> usize {
        self.conversations.read().len()
    }
}

impl MessageStore for MemoryStore {
    fn create_message(
        &self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        text: &str,
        attachments: Vec<NewAttachment>,
    ) -> Result<Message> {
        if text.trim().is_empty() && attachments.is_empty() {
            return Err(StoreError::InvalidInput(
                "message text or attachments required".into(),
            ));
        }
        let mut conversations = self.conversations.write();
        let record = conversations
            .get_mut(conversation_id)
            .ok_or(StoreError::NotFound("conversation"))?;
        if !record.has(sender_id) {
            return Err(StoreError::Forbidden(
                "you are not a participant in this conversation".into(),
            ));
        }
        Ok(record.push_message(sender_id, text, attachments))
    }

    fn list_messages(
        &self,
        conversation_id: &ConversationId,
        page: Page,
    ) -> Result<(Vec<Message>, u64)> {
        let conversations = self.conversations.read();
        let record = conversations
            .get(conversation_id)
            .ok_or(StoreError::NotFound("conversation"))?;
        let messages = record
            .messages
            .iter()
            .rev()
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect();
        Ok((messages, record.messages.len() as u64))
    }

    fn list_conversations(
        &self,
        user_id: &UserId,
        page: Page,
    ) -> Result<(Vec<Conversation>, u64)> {
        let conversations = self.conversations.read();
        let mut mine: Vec<&ConversationRecord> =
            conversations.values().filter(|c| c.has(user_id)).collect();
        mine.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| b.id.cmp(&a.id)));
        let total = mine.len() as u64;
        let page = mine
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .map(|c| c.view(user_id))
            .collect();
        Ok((page, total))
    }

    fn get_or_create_conversation(
        &self,
        creator_id: &UserId,
        request: NewConversation,
    ) -> Result<Conversation> {
        if &request.participant_id == creator_id {
            return Err(StoreError::InvalidInput(
                "cannot start a conversation with yourself".into(),
            ));
        }
        let mut conversations = self.conversations.write();

        let existing = conversations.values().find(|c| {
            c.participants.len() == 2
                && c.has(creator_id)
                && c.has(&request.participant_id)
                && c.contract_id == request.contract_id
                && c.job_id == request.job_id
        });
        if let Some(record) = existing {
            debug!(conversation_id = %record.id, "reusing existing conversation");
            return Ok(record.view(creator_id));
        }

        let now = Utc::now();
        let mut record = ConversationRecord {
            id: ConversationId::new(),
            contract_id: request.contract_id,
            job_id: request.job_id,
            created_at: now,
            updated_at: now,
            participants: vec![
                ParticipantRecord {
                    user_id: creator_id.clone(),
                    last_read_at: None,
                },
                ParticipantRecord {
                    user_id: request.participant_id,
                    last_read_at: None,
                },
            ],
            messages: Vec::new(),
        };
        if let Some(text) = request.initial_message.filter(|t| !t.trim().is_empty()) {
            let _ = record.push_message(creator_id, &text, Vec::new());
        }
        let view = record.view(creator_id);
        debug!(conversation_id = %record.id, "conversation created");
        let _ = conversations.insert(record.id.clone(), record);
        Ok(view)
    }

    fn get_conversation(
        &self,
        conversation_id: &ConversationId,
        viewer_id: &UserId,
    ) -> Result<Conversation> {
        let conversations = self.conversations.read();
        let record = conversations
            .get(conversation_id)
            .ok_or(StoreError::NotFound("conversation"))?;
        if !record.has(viewer_id) {
            return Err(StoreError::Forbidden(
                "you are not a participant in this conversation".into(),
            ));
        }
        Ok(record.view(viewer_id))
    }

    fn mark_read(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<DateTime<Utc>> {
        let mut conversations = self.conversations.write();
        let record = conversations
            .get_mut(conversation_id)
            .ok_or(StoreError::NotFound("conversation"))?;
        let participant = record
            .participants
            .iter_mut()
            .find(|p| &p.user_id == user_id)
            .ok_or_else(|| {
                StoreError::Forbidden("you are not a participant in this conversation".into())
            })?;
        let now = Utc::now();
        participant.last_read_at = Some(now);
        Ok(now)
    }

    fn is_participant(&self, conversation_id: &ConversationId, user_id: &UserId) -> Result<bool> {
        Ok(self
            .conversations
            .read()
            .get(conversation_id)
            .is_some_and(|c| c.has(user_id)))
    }

    fn conversation_partners(&self, user_id: &UserId) -> Result<Vec<UserId>> {
        let conversations = self.conversations.read();
        let partners: BTreeSet<UserId> = conversations
            .values()
            .filter(|c| c.has(user_id))
            .flat_map(|c| c.participants.iter().map(|p| p.user_id.clone()))
            .filter(|u| u != user_id)
            .collect();
        Ok(partners.into_iter().collect())
    }
}
