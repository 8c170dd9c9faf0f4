//! Per-socket connection state.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use trench_core::ids::{ConnectionId, ConversationId, UserId};

/// A serialized text frame, shared between every recipient of a broadcast.
pub type Frame = Arc<str>;

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Frame accepted by the outbound queue.
    Queued,
    /// Queue full. The connection must be torn down.
    Overflow,
    /// Queue already closed by teardown.
    Closed,
}

/// One authenticated WebSocket connection.
///
/// The outbound queue and the membership set are only touched by the
/// hub's command loop and the connection's own pumps.
pub struct Connection {
    /// Unique connection ID.
    pub id: ConnectionId,
    user_id: UserId,
    /// Producer side of the outbound queue; `None` once closed.
    tx: Mutex<Option<mpsc::Sender<Frame>>>,
    cancel: CancellationToken,
    conversations: Mutex<HashSet<ConversationId>>,
    /// When this connection was established.
    pub connected_at: Instant,
    last_pong: Mutex<Instant>,
    evicting: AtomicBool,
    dropped_messages: AtomicU64,
}

impl Connection {
    /// Create a connection owned by `user_id` that feeds `tx`.
    pub fn new(user_id: UserId, tx: mpsc::Sender<Frame>) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            user_id,
            tx: Mutex::new(Some(tx)),
            cancel: CancellationToken::new(),
            conversations: Mutex::new(HashSet::new()),
            connected_at: now,
            last_pong: Mutex::new(now),
            evicting: AtomicBool::new(false),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Owning user.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Enqueue a frame without waiting.
    pub fn send(&self, frame: Frame) -> SendOutcome {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return SendOutcome::Closed;
        };
        match tx.try_send(frame) {
            Ok(()) => SendOutcome::Queued,
            Err(TrySendError::Full(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                SendOutcome::Overflow
            }
            Err(TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Close the outbound queue and cancel the inbound pump.
    ///
    /// The outbound pump drains frames that were already queued, then sends
    /// a Close frame. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        let taken = self.tx.lock().take();
        self.cancel.cancel();
        taken.is_some()
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    /// Record a liveness acknowledgment (Pong, or a client Ping).
    pub fn mark_alive(&self) {
        *self.last_pong.lock() = Instant::now();
    }

    /// Time since the last liveness acknowledgment (or establishment).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Frames rejected because the queue was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Snapshot of joined conversations.
    pub fn conversations(&self) -> Vec<ConversationId> {
        self.conversations.lock().iter().cloned().collect()
    }

    /// Whether the connection has joined `conversation_id`.
    pub fn is_member(&self, conversation_id: &ConversationId) -> bool {
        self.conversations.lock().contains(conversation_id)
    }

    pub(crate) fn add_membership(&self, conversation_id: ConversationId) {
        let _ = self.conversations.lock().insert(conversation_id);
    }

    pub(crate) fn remove_membership(&self, conversation_id: &ConversationId) {
        let _ = self.conversations.lock().remove(conversation_id);
    }

    pub(crate) fn take_memberships(&self) -> HashSet<ConversationId> {
        std::mem::take(&mut *self.conversations.lock())
    }

    /// First caller wins; later overflows of the same connection are ignored.
    pub(crate) fn begin_eviction(&self) -> bool {
        !self.evicting.swap(true, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
