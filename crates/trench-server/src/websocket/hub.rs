//! Connection hub: user and conversation membership, presence, fan-out.
//!
//! All writes to the membership maps are applied by a single [`HubActor`]
//! task consuming a bounded command channel, so the user index and the
//! conversation index can never be updated in conflicting orders. Reads
//! (presence queries, per-user sends) go straight to the shared state under
//! a read lock and never wait on the command loop.
//!
//! Presence edges are published after the write guard is released. Feeds
//! from [`Hub::presence_feed`] are unbounded and see every edge; the
//! `broadcast` channel behind [`Hub::subscribe_presence`] is for observers
//! that can tolerate lag.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trench_core::ids::{ConnectionId, ConversationId, UserId};

use super::connection::{Connection, Frame, SendOutcome};
use crate::metrics::{HUB_BROADCASTS_TOTAL, PRESENCE_TRANSITIONS_TOTAL, WS_SEND_OVERFLOWS_TOTAL};

/// A user's presence edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    /// First connection registered.
    Online(UserId),
    /// Last connection unregistered.
    Offline(UserId),
}

impl PresenceEvent {
    /// The user whose presence changed.
    pub fn user_id(&self) -> &UserId {
        match self {
            Self::Online(u) | Self::Offline(u) => u,
        }
    }

    /// Whether the user is now online.
    pub fn is_online(&self) -> bool {
        matches!(self, Self::Online(_))
    }
}

/// The command loop has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("hub is not running")]
pub struct HubClosed;

/// Hub sizing.
#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    /// Bounded command channel length.
    pub command_capacity: usize,
    /// Presence broadcast buffer length.
    pub presence_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_capacity: 256,
            presence_capacity: 64,
        }
    }
}

type ConnectionSet = HashMap<ConnectionId, Arc<Connection>>;
type PresenceFeeds = Arc<Mutex<Vec<mpsc::UnboundedSender<PresenceEvent>>>>;

#[derive(Default)]
struct HubState {
    users: HashMap<UserId, ConnectionSet>,
    conversations: HashMap<ConversationId, ConnectionSet>,
}

impl HubState {
    fn is_registered(&self, conn: &Connection) -> bool {
        self.users
            .get(conn.user_id())
            .is_some_and(|set| set.contains_key(&conn.id))
    }
}

enum HubCommand {
    Register {
        connection: Arc<Connection>,
        ack: oneshot::Sender<()>,
    },
    Unregister {
        connection: Arc<Connection>,
        ack: Option<oneshot::Sender<()>>,
    },
    Join {
        connection: Arc<Connection>,
        conversation_id: ConversationId,
        ack: oneshot::Sender<bool>,
    },
    Leave {
        connection: Arc<Connection>,
        conversation_id: ConversationId,
        ack: oneshot::Sender<()>,
    },
    Broadcast {
        conversation_id: ConversationId,
        sender_id: UserId,
        frame: Frame,
        exclude_sender: bool,
    },
    Flush {
        ack: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the hub.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::Sender<HubCommand>,
    state: Arc<RwLock<HubState>>,
    presence: broadcast::Sender<PresenceEvent>,
    feeds: PresenceFeeds,
}

/// The single writer of the hub state. Drive it with [`HubActor::run`].
pub struct HubActor {
    commands: mpsc::Receiver<HubCommand>,
    resubmit: mpsc::WeakSender<HubCommand>,
    state: Arc<RwLock<HubState>>,
    presence: broadcast::Sender<PresenceEvent>,
    feeds: PresenceFeeds,
}

impl Hub {
    /// Create a hub handle and the actor that serves it.
    pub fn new(config: HubConfig) -> (Self, HubActor) {
        let (tx, rx) = mpsc::channel(config.command_capacity.max(1));
        let (presence, _) = broadcast::channel(config.presence_capacity.max(1));
        let state = Arc::new(RwLock::new(HubState::default()));
        let feeds = PresenceFeeds::default();
        let actor = HubActor {
            commands: rx,
            resubmit: tx.downgrade(),
            state: state.clone(),
            presence: presence.clone(),
            feeds: feeds.clone(),
        };
        let hub = Self {
            commands: tx,
            state,
            presence,
            feeds,
        };
        (hub, actor)
    }

    /// Create a hub and spawn its actor on the current runtime.
    pub fn spawn(config: HubConfig, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (hub, actor) = Self::new(config);
        let handle = tokio::spawn(actor.run(cancel));
        (hub, handle)
    }

    // ── Mutations (serialized through the actor) ────────────────────

    /// Add a connection to its user's set. Resolves once applied.
    pub async fn register(&self, connection: Arc<Connection>) -> Result<(), HubClosed> {
        let (ack, done) = oneshot::channel();
        self.submit(HubCommand::Register { connection, ack }).await?;
        done.await.map_err(|_| HubClosed)
    }

    /// Remove a connection everywhere and close it. Idempotent.
    pub async fn unregister(&self, connection: Arc<Connection>) -> Result<(), HubClosed> {
        let (ack, done) = oneshot::channel();
        self.submit(HubCommand::Unregister {
            connection,
            ack: Some(ack),
        })
        .await?;
        done.await.map_err(|_| HubClosed)
    }

    /// Add a registered connection to a conversation. Returns `false` if the
    /// connection is no longer registered.
    pub async fn join(
        &self,
        connection: Arc<Connection>,
        conversation_id: ConversationId,
    ) -> Result<bool, HubClosed> {
        let (ack, done) = oneshot::channel();
        self.submit(HubCommand::Join {
            connection,
            conversation_id,
            ack,
        })
        .await?;
        done.await.map_err(|_| HubClosed)
    }

    /// Remove a connection from a conversation.
    pub async fn leave(
        &self,
        connection: Arc<Connection>,
        conversation_id: ConversationId,
    ) -> Result<(), HubClosed> {
        let (ack, done) = oneshot::channel();
        self.submit(HubCommand::Leave {
            connection,
            conversation_id,
            ack,
        })
        .await?;
        done.await.map_err(|_| HubClosed)
    }

    /// Fan a frame out to every connection joined to `conversation_id`,
    /// skipping connections owned by `sender_id` when `exclude_sender`.
    ///
    /// Returns once the command is queued; delivery happens on the actor.
    pub async fn broadcast(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        frame: Frame,
        exclude_sender: bool,
    ) -> Result<(), HubClosed> {
        self.submit(HubCommand::Broadcast {
            conversation_id,
            sender_id,
            frame,
            exclude_sender,
        })
        .await
    }

    /// Wait until every command queued before this call has been applied.
    pub async fn flush(&self) -> Result<(), HubClosed> {
        let (ack, done) = oneshot::channel();
        self.submit(HubCommand::Flush { ack }).await?;
        done.await.map_err(|_| HubClosed)
    }

    async fn submit(&self, command: HubCommand) -> Result<(), HubClosed> {
        self.commands.send(command).await.map_err(|_| HubClosed)
    }

    // ── Reads (shared lock, bypass the actor) ───────────────────────

    /// Whether the user has at least one live connection.
    pub fn is_user_online(&self, user_id: &UserId) -> bool {
        self.state.read().users.contains_key(user_id)
    }

    /// The subset of `candidates` that is online, in input order.
    pub fn online_users<'a>(&self, candidates: impl IntoIterator<Item = &'a UserId>) -> Vec<UserId> {
        let state = self.state.read();
        candidates
            .into_iter()
            .filter(|u| state.users.contains_key(*u))
            .cloned()
            .collect()
    }

    /// Number of users with at least one connection.
    pub fn online_user_count(&self) -> usize {
        self.state.read().users.len()
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.state.read().users.values().map(HashMap::len).sum()
    }

    /// Number of connections a user has open.
    pub fn user_connection_count(&self, user_id: &UserId) -> usize {
        self.state.read().users.get(user_id).map_or(0, HashMap::len)
    }

    /// Number of connections joined to a conversation.
    pub fn conversation_size(&self, conversation_id: &ConversationId) -> usize {
        self.state
            .read()
            .conversations
            .get(conversation_id)
            .map_or(0, HashMap::len)
    }

    /// Distinct users with at least one connection joined to the conversation.
    pub fn conversation_participants(&self, conversation_id: &ConversationId) -> Vec<UserId> {
        let state = self.state.read();
        let mut users: Vec<UserId> = state
            .conversations
            .get(conversation_id)
            .map(|set| set.values().map(|c| c.user_id().clone()).collect())
            .unwrap_or_default();
        users.sort();
        users.dedup();
        users
    }

    /// Enqueue a frame on every connection the user has open, whether or not
    /// they joined any conversation. Returns how many connections took it.
    pub fn send_to_user(&self, user_id: &UserId, frame: &Frame) -> usize {
        let targets: Vec<Arc<Connection>> = self
            .state
            .read()
            .users
            .get(user_id)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for conn in targets {
            match conn.send(frame.clone()) {
                SendOutcome::Queued => delivered += 1,
                SendOutcome::Overflow => evict(&self.commands.downgrade(), conn),
                SendOutcome::Closed => {}
            }
        }
        delivered
    }

    /// Subscribe to presence edges published after this call.
    pub fn subscribe_presence(&self) -> broadcast::Receiver<PresenceEvent> {
        self.presence.subscribe()
    }

    /// Lossless feed of presence edges published after this call. Dropping
    /// the receiver unsubscribes it on the next edge.
    pub fn presence_feed(&self) -> mpsc::UnboundedReceiver<PresenceEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().push(tx);
        rx
    }
}

/// Post an `Unregister` for an overflowing connection from a separate task,
/// so the caller (possibly the actor itself) never waits on the channel.
fn evict(commands: &mpsc::WeakSender<HubCommand>, conn: Arc<Connection>) {
    if !conn.begin_eviction() {
        return;
    }
    counter!(WS_SEND_OVERFLOWS_TOTAL).increment(1);
    warn!(
        connection_id = %conn.id,
        user_id = %conn.user_id(),
        dropped = conn.drop_count(),
        "outbound queue full, disconnecting"
    );
    let Some(tx) = commands.upgrade() else {
        let _ = conn.close();
        return;
    };
    drop(tokio::spawn(async move {
        let connection = conn.clone();
        if tx
            .send(HubCommand::Unregister {
                connection,
                ack: None,
            })
            .await
            .is_err()
        {
            let _ = conn.close();
        }
    }));
}

impl HubActor {
    /// Process commands until cancelled or every [`Hub`] handle is dropped,
    /// then close all remaining connections.
    pub async fn run(mut self, cancel: CancellationToken) {
        debug!("hub started");
        loop {
            let command = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            self.apply(command);
        }
        self.shutdown();
    }

    fn apply(&self, command: HubCommand) {
        match command {
            HubCommand::Register { connection, ack } => {
                self.register(&connection);
                let _ = ack.send(());
            }
            HubCommand::Unregister { connection, ack } => {
                self.unregister(&connection);
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            HubCommand::Join {
                connection,
                conversation_id,
                ack,
            } => {
                let joined = self.join(&connection, conversation_id);
                let _ = ack.send(joined);
            }
            HubCommand::Leave {
                connection,
                conversation_id,
                ack,
            } => {
                self.leave(&connection, &conversation_id);
                let _ = ack.send(());
            }
            HubCommand::Broadcast {
                conversation_id,
                sender_id,
                frame,
                exclude_sender,
            } => self.broadcast(&conversation_id, &sender_id, &frame, exclude_sender),
            HubCommand::Flush { ack } => {
                let _ = ack.send(());
            }
        }
    }

    fn register(&self, conn: &Arc<Connection>) {
        if conn.is_closed() {
            debug!(connection_id = %conn.id, "ignoring register of closed connection");
            return;
        }
        let first = {
            let mut state = self.state.write();
            let set = state.users.entry(conn.user_id().clone()).or_default();
            let first = set.is_empty();
            let _ = set.insert(conn.id.clone(), conn.clone());
            first
        };
        debug!(connection_id = %conn.id, user_id = %conn.user_id(), "connection registered");
        if first {
            self.publish(PresenceEvent::Online(conn.user_id().clone()));
        }
    }

    fn unregister(&self, conn: &Arc<Connection>) {
        let last = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let user_id = conn.user_id();
            let removed_last = state.users.get_mut(user_id).and_then(|set| {
                set.remove(&conn.id).map(|_| set.is_empty())
            });
            if removed_last == Some(true) {
                let _ = state.users.remove(user_id);
            }
            for conversation_id in conn.take_memberships() {
                if let Some(set) = state.conversations.get_mut(&conversation_id) {
                    let _ = set.remove(&conn.id);
                    if set.is_empty() {
                        let _ = state.conversations.remove(&conversation_id);
                    }
                }
            }
            removed_last
        };
        let _ = conn.close();
        match last {
            None => debug!(connection_id = %conn.id, "unregister of unknown connection"),
            Some(last) => {
                debug!(connection_id = %conn.id, user_id = %conn.user_id(), "connection unregistered");
                if last {
                    self.publish(PresenceEvent::Offline(conn.user_id().clone()));
                }
            }
        }
    }

    fn join(&self, conn: &Arc<Connection>, conversation_id: ConversationId) -> bool {
        let mut state = self.state.write();
        if !state.is_registered(conn) {
            debug!(connection_id = %conn.id, %conversation_id, "join from unregistered connection ignored");
            return false;
        }
        let _ = state
            .conversations
            .entry(conversation_id.clone())
            .or_default()
            .insert(conn.id.clone(), conn.clone());
        conn.add_membership(conversation_id);
        true
    }

    fn leave(&self, conn: &Arc<Connection>, conversation_id: &ConversationId) {
        let mut state = self.state.write();
        if let Some(set) = state.conversations.get_mut(conversation_id) {
            let _ = set.remove(&conn.id);
            if set.is_empty() {
                let _ = state.conversations.remove(conversation_id);
            }
        }
        conn.remove_membership(conversation_id);
    }

    fn broadcast(
        &self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        frame: &Frame,
        exclude_sender: bool,
    ) {
        let targets: Vec<Arc<Connection>> = {
            let state = self.state.read();
            state
                .conversations
                .get(conversation_id)
                .map(|set| {
                    set.values()
                        .filter(|c| !(exclude_sender && c.user_id() == sender_id))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        counter!(HUB_BROADCASTS_TOTAL).increment(1);
        debug!(%conversation_id, recipients = targets.len(), "broadcast");
        for conn in targets {
            if conn.send(frame.clone()) == SendOutcome::Overflow {
                evict(&self.resubmit, conn);
            }
        }
    }

    fn publish(&self, event: PresenceEvent) {
        let state = if event.is_online() { "online" } else { "offline" };
        counter!(PRESENCE_TRANSITIONS_TOTAL, "state" => state).increment(1);
        debug!(user_id = %event.user_id(), state, "presence changed");
        self.feeds.lock().retain(|feed| feed.send(event.clone()).is_ok());
        // No subscribers is fine.
        let _ = self.presence.send(event);
    }

    fn shutdown(&mut self) {
        self.commands.close();
        let mut state = self.state.write();
        let count: usize = state.users.values().map(HashMap::len).sum();
        for conn in state.users.values().flat_map(HashMap::values) {
            let _ = conn.close();
        }
        state.users.clear();
        state.conversations.clear();
        info!(closed = count, "hub stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn spawn_hub() -> (Hub, CancellationToken, JoinHandle<()>) {
        let cancel = CancellationToken::new();
        let (hub, handle) = Hub::spawn(HubConfig::default(), cancel.clone());
        (hub, cancel, handle)
    }

    fn make_connection(user: &UserId, capacity: usize) -> (Arc<Connection>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(Connection::new(user.clone(), tx)), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(f) = rx.try_recv() {
            out.push(f.to_string());
        }
        out
    }

    #[tokio::test]
    async fn register_marks_online_and_fires_once() {
        let (hub, _cancel, _h) = spawn_hub();
        let mut presence = hub.subscribe_presence();
        let u = UserId::new();
        let (c1, _r1) = make_connection(&u, 8);
        let (c2, _r2) = make_connection(&u, 8);

        hub.register(c1.clone()).await.unwrap();
        hub.register(c2.clone()).await.unwrap();

        assert!(hub.is_user_online(&u));
        assert_eq!(hub.user_connection_count(&u), 2);
        assert_eq!(presence.try_recv().unwrap(), PresenceEvent::Online(u.clone()));
        assert!(presence.try_recv().is_err());
    }

    #[tokio::test]
    async fn offline_fires_on_last_unregister_only() {
        let (hub, _cancel, _h) = spawn_hub();
        let u = UserId::new();
        let (c1, _r1) = make_connection(&u, 8);
        let (c2, _r2) = make_connection(&u, 8);
        hub.register(c1.clone()).await.unwrap();
        hub.register(c2.clone()).await.unwrap();
        let mut presence = hub.subscribe_presence();

        hub.unregister(c1.clone()).await.unwrap();
        assert!(hub.is_user_online(&u));
        assert!(presence.try_recv().is_err());

        hub.unregister(c2.clone()).await.unwrap();
        assert!(!hub.is_user_online(&u));
        assert_eq!(presence.try_recv().unwrap(), PresenceEvent::Offline(u.clone()));
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let (hub, _cancel, _h) = spawn_hub();
        let mut presence = hub.subscribe_presence();
        let u = UserId::new();
        let (c, _r) = make_connection(&u, 8);
        hub.register(c.clone()).await.unwrap();
        hub.unregister(c.clone()).await.unwrap();
        hub.unregister(c.clone()).await.unwrap();

        assert!(c.is_closed());
        let events: Vec<_> = std::iter::from_fn(|| presence.try_recv().ok()).collect();
        assert_eq!(
            events,
            vec![PresenceEvent::Online(u.clone()), PresenceEvent::Offline(u)]
        );
    }

    #[tokio::test]
    async fn presence_feed_keeps_every_edge_in_a_burst() {
        let (hub, _cancel, _h) = spawn_hub();
        let mut feed = hub.presence_feed();
        let mut lagging = hub.subscribe_presence();
        let burst = HubConfig::default().presence_capacity * 2;

        let mut live = Vec::new();
        for _ in 0..burst {
            let (c, r) = make_connection(&UserId::new(), 8);
            hub.register(c.clone()).await.unwrap();
            live.push((c, r));
        }
        for (c, _) in &live {
            hub.unregister(c.clone()).await.unwrap();
        }

        let edges: Vec<_> = std::iter::from_fn(|| feed.try_recv().ok()).collect();
        assert_eq!(edges.len(), burst * 2);
        assert_eq!(edges.iter().filter(|e| e.is_online()).count(), burst);
        for (edge, (c, _)) in edges.iter().zip(&live) {
            assert_eq!(edge, &PresenceEvent::Online(c.user_id().clone()));
        }
        assert!(matches!(
            lagging.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(_))
        ));
    }

    #[tokio::test]
    async fn dropped_feed_is_pruned() {
        let (hub, _cancel, _h) = spawn_hub();
        drop(hub.presence_feed());
        let mut kept = hub.presence_feed();
        let u = UserId::new();
        let (c, _r) = make_connection(&u, 8);
        hub.register(c.clone()).await.unwrap();

        assert_eq!(kept.try_recv().unwrap(), PresenceEvent::Online(u));
        assert_eq!(hub.feeds.lock().len(), 1);
    }

    #[tokio::test]
    async fn unregister_closes_queue() {
        let (hub, _cancel, _h) = spawn_hub();
        let u = UserId::new();
        let (c, mut rx) = make_connection(&u, 8);
        hub.register(c.clone()).await.unwrap();
        assert_eq!(c.send(Frame::from("pending")), SendOutcome::Queued);
        hub.unregister(c.clone()).await.unwrap();
        assert_eq!(&*rx.recv().await.unwrap(), "pending");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn broadcast_excluding_sender_reaches_k_minus_one() {
        let (hub, _cancel, _h) = spawn_hub();
        let conv = ConversationId::new();
        let (a, b, c) = (UserId::new(), UserId::new(), UserId::new());
        let (ca, mut ra) = make_connection(&a, 8);
        let (cb, mut rb) = make_connection(&b, 8);
        let (cc, mut rc) = make_connection(&c, 8);
        for conn in [&ca, &cb, &cc] {
            hub.register(conn.clone()).await.unwrap();
            assert!(hub.join(conn.clone(), conv.clone()).await.unwrap());
        }

        hub.broadcast(conv.clone(), a.clone(), Frame::from("m"), true)
            .await
            .unwrap();
        hub.flush().await.unwrap();

        assert!(drain(&mut ra).is_empty());
        assert_eq!(drain(&mut rb), ["m"]);
        assert_eq!(drain(&mut rc), ["m"]);
    }

    #[tokio::test]
    async fn broadcast_without_exclusion_reaches_senders_other_connections() {
        let (hub, _cancel, _h) = spawn_hub();
        let conv = ConversationId::new();
        let a = UserId::new();
        let (phone, mut r_phone) = make_connection(&a, 8);
        let (laptop, mut r_laptop) = make_connection(&a, 8);
        for conn in [&phone, &laptop] {
            hub.register(conn.clone()).await.unwrap();
            let _ = hub.join(conn.clone(), conv.clone()).await.unwrap();
        }

        hub.broadcast(conv.clone(), a.clone(), Frame::from("typing"), false)
            .await
            .unwrap();
        hub.flush().await.unwrap();
        assert_eq!(drain(&mut r_phone), ["typing"]);
        assert_eq!(drain(&mut r_laptop), ["typing"]);

        hub.broadcast(conv, a, Frame::from("msg"), true).await.unwrap();
        hub.flush().await.unwrap();
        assert!(drain(&mut r_phone).is_empty());
        assert!(drain(&mut r_laptop).is_empty());
    }

    #[tokio::test]
    async fn non_member_receives_nothing_but_user_send_works() {
        let (hub, _cancel, _h) = spawn_hub();
        let conv = ConversationId::new();
        let (a, b) = (UserId::new(), UserId::new());
        let (ca, _ra) = make_connection(&a, 8);
        let (cb, mut rb) = make_connection(&b, 8);
        hub.register(ca.clone()).await.unwrap();
        hub.register(cb.clone()).await.unwrap();
        let _ = hub.join(ca.clone(), conv.clone()).await.unwrap();

        hub.broadcast(conv, a, Frame::from("m"), false).await.unwrap();
        hub.flush().await.unwrap();
        assert!(drain(&mut rb).is_empty());

        assert_eq!(hub.send_to_user(&b, &Frame::from("direct")), 1);
        assert_eq!(drain(&mut rb), ["direct"]);
    }

    #[tokio::test]
    async fn join_after_unregister_is_ignored() {
        let (hub, _cancel, _h) = spawn_hub();
        let conv = ConversationId::new();
        let u = UserId::new();
        let (c, _r) = make_connection(&u, 8);
        hub.register(c.clone()).await.unwrap();
        hub.unregister(c.clone()).await.unwrap();

        assert!(!hub.join(c.clone(), conv.clone()).await.unwrap());
        assert_eq!(hub.conversation_size(&conv), 0);
        assert!(c.conversations().is_empty());
    }

    #[tokio::test]
    async fn leave_removes_membership_and_empty_sets() {
        let (hub, _cancel, _h) = spawn_hub();
        let conv = ConversationId::new();
        let u = UserId::new();
        let (c, _r) = make_connection(&u, 8);
        hub.register(c.clone()).await.unwrap();
        let _ = hub.join(c.clone(), conv.clone()).await.unwrap();
        assert_eq!(hub.conversation_participants(&conv), vec![u.clone()]);

        hub.leave(c.clone(), conv.clone()).await.unwrap();
        assert_eq!(hub.conversation_size(&conv), 0);
        assert!(!c.is_member(&conv));
        assert!(hub.conversation_participants(&conv).is_empty());
    }

    #[tokio::test]
    async fn overflow_evicts_connection_everywhere_once() {
        let (hub, _cancel, _h) = spawn_hub();
        let mut presence = hub.subscribe_presence();
        let (c1, c2) = (ConversationId::new(), ConversationId::new());
        let (slow_user, fast_user) = (UserId::new(), UserId::new());
        let (slow, _slow_rx) = make_connection(&slow_user, 1);
        let (fast, mut fast_rx) = make_connection(&fast_user, 64);
        for conn in [&slow, &fast] {
            hub.register(conn.clone()).await.unwrap();
            let _ = hub.join(conn.clone(), c1.clone()).await.unwrap();
            let _ = hub.join(conn.clone(), c2.clone()).await.unwrap();
        }
        let _ = std::iter::from_fn(|| presence.try_recv().ok()).count();

        for i in 0..5 {
            hub.broadcast(c1.clone(), UserId::new(), Frame::from(format!("m{i}")), false)
                .await
                .unwrap();
        }
        hub.flush().await.unwrap();
        // Eviction is posted from a spawned task; wait for it to land.
        for _ in 0..50 {
            if !hub.is_user_online(&slow_user) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            hub.flush().await.unwrap();
        }

        assert!(slow.is_closed());
        assert!(!hub.is_user_online(&slow_user));
        assert_eq!(hub.conversation_size(&c1), 1);
        assert_eq!(hub.conversation_size(&c2), 1);
        assert_eq!(drain(&mut fast_rx).len(), 5);
        let events: Vec<_> = std::iter::from_fn(|| presence.try_recv().ok()).collect();
        assert_eq!(events, vec![PresenceEvent::Offline(slow_user)]);

        hub.broadcast(c2.clone(), UserId::new(), Frame::from("after"), false)
            .await
            .unwrap();
        hub.flush().await.unwrap();
        assert_eq!(drain(&mut fast_rx), ["after"]);
    }

    #[tokio::test]
    async fn online_users_filters_candidates() {
        let (hub, _cancel, _h) = spawn_hub();
        let (a, b) = (UserId::new(), UserId::new());
        let (ca, _ra) = make_connection(&a, 8);
        hub.register(ca).await.unwrap();
        assert_eq!(hub.online_users([&a, &b]), vec![a.clone()]);
        assert_eq!(hub.online_user_count(), 1);
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn cancel_stops_actor_and_closes_connections() {
        let (hub, cancel, handle) = spawn_hub();
        let u = UserId::new();
        let (c, _r) = make_connection(&u, 8);
        hub.register(c.clone()).await.unwrap();

        cancel.cancel();
        handle.await.unwrap();

        assert!(c.is_closed());
        assert!(!hub.is_user_online(&u));
        assert_eq!(hub.flush().await, Err(HubClosed));
    }

    #[tokio::test]
    async fn actor_exits_when_handles_dropped() {
        let (hub, actor) = Hub::new(HubConfig::default());
        let handle = tokio::spawn(actor.run(CancellationToken::new()));
        drop(hub);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_bursts_fire_each_edge_once() {
        let (hub, _cancel, _h) = spawn_hub();
        let mut presence = hub.subscribe_presence();
        let u = UserId::new();

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let hub = hub.clone();
            let u = u.clone();
            tasks.push(tokio::spawn(async move {
                let (c, _r) = make_connection(&u, 4);
                hub.register(c.clone()).await.unwrap();
                tokio::task::yield_now().await;
                hub.unregister(c).await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        hub.flush().await.unwrap();

        assert!(!hub.is_user_online(&u));
        let events: Vec<_> = std::iter::from_fn(|| presence.try_recv().ok()).collect();
        // Edges strictly alternate, starting online and ending offline.
        assert!(!events.is_empty());
        for (i, e) in events.iter().enumerate() {
            assert_eq!(e.is_online(), i % 2 == 0, "edge {i} out of order: {events:?}");
        }
        assert!(!events.last().unwrap().is_online());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register(usize),
        Unregister(usize, usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..3).prop_map(Op::Register),
            (0usize..3, 0usize..4).prop_map(|(u, i)| Op::Unregister(u, i)),
        ]
    }

    proptest! {
        #[test]
        fn presence_tracks_live_connection_count(ops in prop::collection::vec(op(), 1..40)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async move {
                let (hub, _cancel, _h) = spawn_hub();
                let mut presence = hub.subscribe_presence();
                let users: Vec<UserId> = (0..3).map(|_| UserId::new()).collect();
                let mut live: Vec<Vec<(Arc<Connection>, mpsc::Receiver<Frame>)>> =
                    vec![Vec::new(), Vec::new(), Vec::new()];
                let mut expected_edges = Vec::new();

                for op in ops {
                    match op {
                        Op::Register(u) => {
                            let pair = make_connection(&users[u], 4);
                            hub.register(pair.0.clone()).await.unwrap();
                            if live[u].is_empty() {
                                expected_edges.push(PresenceEvent::Online(users[u].clone()));
                            }
                            live[u].push(pair);
                        }
                        Op::Unregister(u, i) => {
                            if live[u].is_empty() {
                                continue;
                            }
                            let idx = i % live[u].len();
                            let (conn, _rx) = live[u].remove(idx);
                            hub.unregister(conn.clone()).await.unwrap();
                            // A second unregister must not fire a duplicate edge.
                            hub.unregister(conn).await.unwrap();
                            if live[u].is_empty() {
                                expected_edges.push(PresenceEvent::Offline(users[u].clone()));
                            }
                        }
                    }
                    for (u, user) in users.iter().enumerate() {
                        assert_eq!(hub.is_user_online(user), !live[u].is_empty());
                        assert_eq!(hub.user_connection_count(user), live[u].len());
                    }
                }

                let edges: Vec<_> = std::iter::from_fn(|| presence.try_recv().ok()).collect();
                assert_eq!(edges, expected_edges);
            });
        }
    }
}
