//! Presence bridge: turns hub presence edges into `presence` notifications
//! for every online user who shares a conversation with the subject.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use trench_store::MessageStore;

use super::connection::Frame;
use super::hub::{Hub, PresenceEvent};
use crate::rpc::codec::encode;
use crate::rpc::types::RpcNotification;

/// Consumes [`PresenceEvent`]s and pushes them to conversation partners.
pub struct PresenceBridge {
    hub: Hub,
    store: Arc<dyn MessageStore>,
    events: mpsc::UnboundedReceiver<PresenceEvent>,
}

impl PresenceBridge {
    /// Attach a lossless presence feed to `hub`.
    pub fn new(hub: Hub, store: Arc<dyn MessageStore>) -> Self {
        let events = hub.presence_feed();
        Self { hub, store, events }
    }

    /// Run until cancelled or the hub stops.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = self.events.recv() => event,
            };
            match event {
                Some(event) => self.fan_out(event).await,
                None => break,
            }
        }
        debug!("presence bridge stopped");
    }

    async fn fan_out(&self, event: PresenceEvent) {
        let user_id = event.user_id().clone();
        let store = self.store.clone();
        let lookup = user_id.clone();
        let partners = match tokio::task::spawn_blocking(move || store.conversation_partners(&lookup)).await {
            Ok(Ok(partners)) => partners,
            Ok(Err(e)) => {
                warn!(%user_id, error = %e, "presence partner lookup failed");
                return;
            }
            Err(e) => {
                warn!(%user_id, error = %e, "presence partner lookup panicked");
                return;
            }
        };

        let notification = RpcNotification::new(
            "presence",
            json!({ "userId": user_id, "isOnline": event.is_online() }),
        );
        let frame = match encode(&notification) {
            Ok(text) => Frame::from(text),
            Err(e) => {
                warn!(error = %e, "failed to encode presence notification");
                return;
            }
        };

        let mut delivered = 0;
        for partner in self.hub.online_users(&partners) {
            delivered += self.hub.send_to_user(&partner, &frame);
        }
        debug!(%user_id, online = event.is_online(), delivered, "presence fanned out");
    }
}
