//! # trench-store
//!
//! The persistence boundary of the chat core.
//!
//! [`MessageStore`] is the contract the RPC handlers consume. Calls are
//! synchronous and fallible; an implementation backed by a remote database
//! is expected to run them on a blocking pool. [`MemoryStore`] is the
//! in-process implementation used by the daemon and the test suites.

#![deny(unsafe_code)]

pub mod errors;
pub mod memory;

pub use errors::{Result, StoreError};
pub use memory::MemoryStore;

use chrono::{DateTime, Utc};
use trench_core::chat::{Conversation, Message, NewAttachment};
use trench_core::ids::{ContractId, ConversationId, JobId, UserId};

/// Limit/offset window for list operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Page {
    /// Maximum number of items to return.
    pub limit: usize,
    /// Items to skip from the start.
    pub offset: usize,
}

impl Page {
    /// Construct a page window.
    pub fn new(limit: usize, offset: usize) -> Self {
        Self { limit, offset }
    }
}

/// Request to open (or reuse) a two-party conversation.
#[derive(Clone, Debug)]
pub struct NewConversation {
    /// The other party.
    pub participant_id: UserId,
    /// Contract the conversation is about.
    pub contract_id: Option<ContractId>,
    /// Job the conversation is about.
    pub job_id: Option<JobId>,
    /// Text posted by the creator when the conversation is first created.
    pub initial_message: Option<String>,
}

/// Persistence contract for messages and conversations.
pub trait MessageStore: Send + Sync {
    /// Persist a message authored by `sender_id`.
    ///
    /// Fails with `InvalidInput` when both text and attachments are empty,
    /// `NotFound` for an unknown conversation, and `Forbidden` when the
    /// sender is not a participant.
    fn create_message(
        &self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        text: &str,
        attachments: Vec<NewAttachment>,
    ) -> Result<Message>;

    /// Messages in a conversation, newest first, plus the total count.
    fn list_messages(
        &self,
        conversation_id: &ConversationId,
        page: Page,
    ) -> Result<(Vec<Message>, u64)>;

    /// Conversations `user_id` participates in, most recently active first,
    /// plus the total count.
    fn list_conversations(&self, user_id: &UserId, page: Page)
    -> Result<(Vec<Conversation>, u64)>;

    /// Return the existing conversation between the creator and
    /// `participant_id` with the same contract/job binding, or create one.
    /// `initial_message` is only posted on creation.
    fn get_or_create_conversation(
        &self,
        creator_id: &UserId,
        request: NewConversation,
    ) -> Result<Conversation>;

    /// A single conversation as seen by `viewer_id`, who must participate.
    fn get_conversation(
        &self,
        conversation_id: &ConversationId,
        viewer_id: &UserId,
    ) -> Result<Conversation>;

    /// Move `user_id`'s read marker to now and return the new marker.
    fn mark_read(&self, conversation_id: &ConversationId, user_id: &UserId)
    -> Result<DateTime<Utc>>;

    /// Whether `user_id` participates in the conversation. Unknown
    /// conversations yield `false`.
    fn is_participant(&self, conversation_id: &ConversationId, user_id: &UserId) -> Result<bool>;

    /// Distinct users sharing at least one conversation with `user_id`.
    fn conversation_partners(&self, user_id: &UserId) -> Result<Vec<UserId>>;
}
