pub mod channels;
pub mod registry;
pub mod store;

pub use channels::ChannelDirectory;
pub use registry::IdentityRegistry;
pub use store::MessageStore;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::Message as WsMessage;
use log::{debug, warn};
use tokio::sync::{Mutex, RwLock};

use crate::error::ChatError;
use crate::security::{KeyedRateLimiter, SharedConnectionTracker};
use crate::{ChannelSender, ConnId, Identity, LostReason, Presence, ServerEvent, UserId};

/// Shared state across all connections. Read-heavy maps use RwLock so
/// fan-out never blocks readers; the SQLite store serializes its writes
/// behind a Mutex, which also yields FIFO push order per directed pair.
pub struct AppState {
    pub registry: RwLock<IdentityRegistry>,
    pub channels: RwLock<ChannelDirectory>,
    pub store: Mutex<MessageStore>,
    pub idle_timeout: Duration,
    pub started_at: Instant,
    /// WebSocket connection limits (global and per-IP); limits 0 = no cap.
    pub connection_tracker: SharedConnectionTracker,
    /// Per-IP WebSocket frame rate limiter; None = no limit.
    pub ws_rate_limiter: Option<Arc<KeyedRateLimiter>>,
}

impl AppState {
    pub fn new(
        store: MessageStore,
        known_identities: Vec<Identity>,
        idle_timeout: Duration,
        connection_tracker: SharedConnectionTracker,
        ws_rate_limiter: Option<Arc<KeyedRateLimiter>>,
    ) -> Self {
        Self {
            registry: RwLock::new(IdentityRegistry::new(known_identities)),
            channels: RwLock::new(ChannelDirectory::new()),
            store: Mutex::new(store),
            idle_timeout,
            started_at: Instant::now(),
            connection_tracker,
            ws_rate_limiter,
        }
    }

    /// The `register` operation: mint or reuse an identity, then persist it.
    pub async fn register_identity(
        &self,
        display_name: &str,
        account_id: Option<String>,
    ) -> Result<Identity, ChatError> {
        let identity = {
            let mut registry = self.registry.write().await;
            registry.register(display_name, account_id)?
        };
        {
            let store = self.store.lock().await;
            store.upsert_identity(&identity)?;
        }
        Ok(identity)
    }

    /// Session open: bind the delivery channel (superseding any previous
    /// one), flip presence to Online, broadcast it, and hand the new channel
    /// its identity snapshot.
    pub async fn open_session(
        &self,
        user_id: &UserId,
        conn_id: &ConnId,
        sender: ChannelSender,
    ) -> Result<(), ChatError> {
        let superseded = {
            let mut channels = self.channels.write().await;
            channels.bind(user_id.clone(), conn_id.clone(), sender.clone())
        };
        if let Some(old) = superseded {
            debug!("Channel for {} superseded by {}", user_id, conn_id);
            send_event(
                &old.sender,
                &ServerEvent::ConnectionLost {
                    reason: LostReason::Superseded,
                },
            );
            let _ = old.sender.send(WsMessage::Close(None));
        }

        let me = {
            let mut registry = self.registry.write().await;
            registry.set_status(user_id, Presence::Online)
        }
        .ok_or_else(|| ChatError::NotFound(format!("identity {}", user_id)))?;

        self.broadcast_status(&me).await;

        let snapshot = {
            let registry = self.registry.read().await;
            registry.snapshot(Some(user_id))
        };
        send_event(&sender, &ServerEvent::IdentitySnapshot { identities: snapshot });

        self.persist_identity(&me).await;
        Ok(())
    }

    /// Session close: unbind (only if this connection still owns the
    /// binding), flip presence to Offline, broadcast it. Supersession,
    /// transport failure, and idle timeout all funnel through here.
    pub async fn close_session(&self, user_id: &UserId, conn_id: &ConnId) {
        let unbound = {
            let mut channels = self.channels.write().await;
            channels.unbind(user_id, conn_id)
        };
        if !unbound {
            return;
        }

        let me = {
            let mut registry = self.registry.write().await;
            registry.set_status(user_id, Presence::Offline)
        };
        if let Some(me) = me {
            self.broadcast_status(&me).await;
            self.persist_identity(&me).await;
        }
    }

    /// Push an event to one identity's channel. Returns false if no channel
    /// is bound; the polling backstop covers delivery in that case.
    pub async fn push_to_user(&self, user_id: &UserId, event: &ServerEvent) -> bool {
        let sender = {
            let channels = self.channels.read().await;
            channels.sender_for(user_id)
        };
        match sender {
            Some(sender) => {
                send_event(&sender, event);
                true
            }
            None => false,
        }
    }

    /// Presence fan-out to every bound channel except the subject's own.
    pub async fn broadcast_status(&self, identity: &Identity) {
        let event = ServerEvent::UserStatus {
            user_id: identity.id.clone(),
            status: identity.status,
            last_seen: identity.last_seen,
        };
        let Ok(json) = serde_json::to_string(&event) else {
            return;
        };

        let channels = self.channels.read().await;
        for sender in channels.all_except(&identity.id) {
            let _ = sender.send(WsMessage::Text(json.clone()));
        }
    }

    async fn persist_identity(&self, identity: &Identity) {
        let store = self.store.lock().await;
        if let Err(e) = store.upsert_identity(identity) {
            warn!("Failed to persist identity {}: {}", identity.id, e);
        }
    }
}

/// Serialize and enqueue one event on a channel. Send failures are ignored:
/// the channel's own connection loop notices the closed socket.
pub(crate) fn send_event(sender: &ChannelSender, event: &ServerEvent) {
    let Ok(json) = serde_json::to_string(event) else {
        return;
    };
    let _ = sender.send(WsMessage::Text(json));
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::security::ConnectionTracker;
    use tokio::sync::mpsc;

    pub(crate) fn test_state() -> AppState {
        AppState::new(
            MessageStore::in_memory().unwrap(),
            Vec::new(),
            Duration::from_secs(120),
            Arc::new(RwLock::new(ConnectionTracker::new(0, 0))),
            None,
        )
    }

    pub(crate) fn recv_event(
        rx: &mut mpsc::UnboundedReceiver<WsMessage>,
    ) -> ServerEvent {
        loop {
            match rx.try_recv().expect("expected an event") {
                WsMessage::Text(json) => return serde_json::from_str(&json).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_open_session_broadcasts_online_and_snapshots() {
        let state = test_state();
        let alice = state.register_identity("alice", None).await.unwrap();
        let bob = state.register_identity("bob", None).await.unwrap();

        let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
        state.open_session(&alice.id, &"c1".to_string(), alice_tx).await.unwrap();

        // Alice's own channel gets the snapshot, which excludes her and shows
        // bob offline.
        match recv_event(&mut alice_rx) {
            ServerEvent::IdentitySnapshot { identities } => {
                assert_eq!(identities.len(), 1);
                assert_eq!(identities[0].id, bob.id);
                assert_eq!(identities[0].status, Presence::Offline);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        state.open_session(&bob.id, &"c2".to_string(), bob_tx).await.unwrap();

        // Alice hears bob come online; bob does not hear about himself.
        match recv_event(&mut alice_rx) {
            ServerEvent::UserStatus { user_id, status, .. } => {
                assert_eq!(user_id, bob.id);
                assert_eq!(status, Presence::Online);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match recv_event(&mut bob_rx) {
            ServerEvent::IdentitySnapshot { identities } => {
                assert_eq!(identities[0].status, Presence::Online);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_session_broadcasts_offline() {
        let state = test_state();
        let alice = state.register_identity("alice", None).await.unwrap();
        let bob = state.register_identity("bob", None).await.unwrap();

        let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
        let (bob_tx, _bob_rx) = mpsc::unbounded_channel();
        state.open_session(&alice.id, &"c1".to_string(), alice_tx).await.unwrap();
        state.open_session(&bob.id, &"c2".to_string(), bob_tx).await.unwrap();
        let _ = recv_event(&mut alice_rx); // snapshot
        let _ = recv_event(&mut alice_rx); // bob online

        state.close_session(&bob.id, &"c2".to_string()).await;
        match recv_event(&mut alice_rx) {
            ServerEvent::UserStatus { user_id, status, .. } => {
                assert_eq!(user_id, bob.id);
                assert_eq!(status, Presence::Offline);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let registry = state.registry.read().await;
        assert_eq!(registry.get(&bob.id).unwrap().status, Presence::Offline);
    }

    #[tokio::test]
    async fn test_supersession_notifies_old_channel_and_keeps_new() {
        let state = test_state();
        let alice = state.register_identity("alice", None).await.unwrap();

        let (old_tx, mut old_rx) = mpsc::unbounded_channel();
        let (new_tx, _new_rx) = mpsc::unbounded_channel();
        state.open_session(&alice.id, &"c1".to_string(), old_tx).await.unwrap();
        let _ = recv_event(&mut old_rx); // snapshot

        state.open_session(&alice.id, &"c2".to_string(), new_tx).await.unwrap();

        match recv_event(&mut old_rx) {
            ServerEvent::ConnectionLost { reason } => assert_eq!(reason, LostReason::Superseded),
            other => panic!("unexpected event: {:?}", other),
        }
        // The superseded channel also gets a close frame.
        assert!(matches!(old_rx.try_recv(), Ok(WsMessage::Close(_))));

        // Late cleanup from the old connection must not unbind the new one.
        state.close_session(&alice.id, &"c1".to_string()).await;
        let channels = state.channels.read().await;
        assert!(channels.sender_for(&alice.id).is_some());
        drop(channels);
        let registry = state.registry.read().await;
        assert_eq!(registry.get(&alice.id).unwrap().status, Presence::Online);
    }

    #[tokio::test]
    async fn test_open_session_unknown_identity() {
        let state = test_state();
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = state
            .open_session(&"ghost".to_string(), &"c1".to_string(), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_push_to_unbound_user_reports_false() {
        let state = test_state();
        let alice = state.register_identity("alice", None).await.unwrap();
        let delivered = state
            .push_to_user(&alice.id, &ServerEvent::Pong)
            .await;
        assert!(!delivered);
    }
}
