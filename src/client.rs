//! Client-side synchronization state machine.
//!
//! Converts the relay's push events into a consistent local view: an
//! identity mirror, the active conversation, and per-peer unread counters.
//! Push is an optimization; the host is expected to poll `listIdentities` /
//! `listConversation` periodically and feed the results back through the
//! `refresh_*` methods as the correctness backstop.
//!
//! The transport is injected as a capability (`FrameSink`), constructed once
//! per session and dropped on disconnect; the state machine itself holds no
//! socket and performs no retries — reconnection policy belongs to the host.

use std::collections::HashMap;

use chrono::Utc;
use log::warn;

use crate::error::ChatError;
use crate::{ClientFrame, Identity, Message, Presence, ServerEvent, UserId};

/// Outbound half of the delivery channel, injected by the host. An
/// implementation typically enqueues frames onto the WebSocket writer task.
pub trait FrameSink {
    fn send_frame(&self, frame: ClientFrame) -> Result<(), ChatError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Registering,
    Connecting,
    Connected,
}

/// A locally echoed send awaiting its `message_sent` confirmation.
struct PendingEcho {
    local_id: String,
    to_id: UserId,
    content: String,
}

pub struct ClientSession<S: FrameSink> {
    sink: S,
    state: SessionState,
    me: Option<Identity>,
    /// Mirror of every other identity, keyed by id.
    peers: HashMap<UserId, Identity>,
    /// The conversation currently on screen, if any.
    active_peer: Option<UserId>,
    conversation: Vec<Message>,
    unread: HashMap<UserId, u32>,
    pending: Vec<PendingEcho>,
    last_typing: Option<UserId>,
}

impl<S: FrameSink> ClientSession<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            state: SessionState::Disconnected,
            me: None,
            peers: HashMap::new(),
            active_peer: None,
            conversation: Vec::new(),
            unread: HashMap::new(),
            pending: Vec::new(),
            last_typing: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn me(&self) -> Option<&Identity> {
        self.me.as_ref()
    }

    pub fn peers(&self) -> &HashMap<UserId, Identity> {
        &self.peers
    }

    pub fn conversation(&self) -> &[Message] {
        &self.conversation
    }

    pub fn unread_for(&self, peer_id: &UserId) -> u32 {
        self.unread.get(peer_id).copied().unwrap_or(0)
    }

    /// Last peer seen typing, consumed by the UI.
    pub fn take_typing(&mut self) -> Option<UserId> {
        self.last_typing.take()
    }

    // ---------- Lifecycle ----------

    pub fn begin_registration(&mut self) {
        self.state = SessionState::Registering;
    }

    /// Registration failed (e.g. InvalidName); surfaced to the caller, back
    /// to square one.
    pub fn registration_failed(&mut self) {
        self.state = SessionState::Disconnected;
        self.me = None;
    }

    pub fn registered(&mut self, me: Identity) {
        self.me = Some(me);
        self.state = SessionState::Connecting;
    }

    pub fn channel_open(&mut self) {
        if let Some(me) = &mut self.me {
            me.status = Presence::Online;
        }
        self.state = SessionState::Connected;
    }

    /// Channel open failed. Retry/backoff is the host's call.
    pub fn channel_failed(&mut self) {
        self.state = SessionState::Disconnected;
    }

    // ---------- Outbound ----------

    /// Send a message with optimistic local echo. The returned provisional
    /// message is replaced in place once `message_sent` arrives.
    pub fn send_message(&mut self, to_id: &UserId, content: &str) -> Result<Message, ChatError> {
        if self.state != SessionState::Connected {
            return Err(ChatError::Transport("channel is not open".to_string()));
        }
        let me = self
            .me
            .as_ref()
            .ok_or_else(|| ChatError::Transport("no identity".to_string()))?;

        self.sink.send_frame(ClientFrame::Send {
            to_id: to_id.clone(),
            content: content.to_string(),
        })?;

        let provisional = Message {
            id: format!("local:{}", uuid::Uuid::new_v4()),
            from_id: me.id.clone(),
            to_id: to_id.clone(),
            content: content.to_string(),
            timestamp: Utc::now(),
            read: false,
        };
        if self.active_peer.as_ref() == Some(to_id) {
            self.conversation.push(provisional.clone());
        }
        self.pending.push(PendingEcho {
            local_id: provisional.id.clone(),
            to_id: to_id.clone(),
            content: content.to_string(),
        });
        Ok(provisional)
    }

    /// Make a conversation the active view, seeding the mirror from a
    /// `listConversation` fetch. Everything unread addressed to us is marked
    /// read in one shot; a failed mark is reported, not retried.
    pub fn open_conversation(&mut self, peer_id: &UserId, messages: Vec<Message>) {
        self.active_peer = Some(peer_id.clone());
        self.conversation = messages;
        self.restore_pending_echoes(peer_id);
        self.unread.remove(peer_id);

        let has_unread_inbound = self.me.as_ref().map_or(false, |me| {
            self.conversation
                .iter()
                .any(|m| m.to_id == me.id && !m.read)
        });
        if has_unread_inbound {
            if let Err(e) = self.sink.send_frame(ClientFrame::ReadConversation {
                peer_id: peer_id.clone(),
            }) {
                warn!("Failed to send read receipt for conversation with {}: {}", peer_id, e);
            }
        }
    }

    pub fn close_conversation(&mut self) {
        self.active_peer = None;
        self.conversation.clear();
    }

    // ---------- Poll backstops ----------

    /// Replace the identity mirror from a `listIdentities` poll.
    pub fn refresh_identities(&mut self, identities: Vec<Identity>) {
        let my_id = self.me.as_ref().map(|m| m.id.clone());
        self.peers = identities
            .into_iter()
            .filter(|i| Some(&i.id) != my_id.as_ref())
            .map(|i| (i.id.clone(), i))
            .collect();
    }

    /// Replace the active conversation from a `listConversation` poll.
    /// Provisional echoes that the server has not yet confirmed stay at the
    /// tail.
    pub fn refresh_conversation(&mut self, peer_id: &UserId, messages: Vec<Message>) {
        if self.active_peer.as_ref() != Some(peer_id) {
            return;
        }
        self.conversation = messages;
        self.restore_pending_echoes(peer_id);
    }

    /// Replace unread counters from an unread-counts poll (reconnect).
    pub fn refresh_unread(&mut self, counts: HashMap<UserId, u32>) {
        self.unread = counts;
        if let Some(active) = &self.active_peer {
            self.unread.remove(active);
        }
    }

    // ---------- Inbound events ----------

    pub fn apply_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::NewMessage { message } => self.on_new_message(message),
            ServerEvent::MessageSent { message } => self.on_message_sent(message),
            ServerEvent::MessageRead { message_id, .. } => {
                if let Some(msg) = self.conversation.iter_mut().find(|m| m.id == message_id) {
                    msg.read = true;
                }
            }
            ServerEvent::UserStatus {
                user_id,
                status,
                last_seen,
            } => {
                if let Some(peer) = self.peers.get_mut(&user_id) {
                    peer.status = status;
                    peer.last_seen = last_seen;
                }
                // Unknown ids are picked up by the next identity poll.
            }
            ServerEvent::Typing { from_id } => {
                self.last_typing = Some(from_id);
            }
            ServerEvent::IdentitySnapshot { identities } => {
                self.refresh_identities(identities);
            }
            ServerEvent::ConnectionLost { reason } => {
                warn!("Delivery channel lost: {:?}", reason);
                self.state = SessionState::Disconnected;
                if let Some(me) = &mut self.me {
                    me.status = Presence::Offline;
                }
            }
            ServerEvent::Error { message } => {
                warn!("Relay error: {}", message);
            }
            ServerEvent::Pong => {}
        }
    }

    fn on_new_message(&mut self, mut message: Message) {
        if self.active_peer.as_ref() == Some(&message.from_id) {
            // Visible right now: acknowledge immediately. Not retried; the
            // next open_conversation covers a lost receipt.
            if let Err(e) = self.sink.send_frame(ClientFrame::Read {
                message_id: message.id.clone(),
            }) {
                warn!("Failed to send read receipt for {}: {}", message.id, e);
            } else {
                message.read = true;
            }
            self.conversation.push(message);
        } else {
            *self.unread.entry(message.from_id.clone()).or_insert(0) += 1;
        }
    }

    fn on_message_sent(&mut self, message: Message) {
        // Reconcile the oldest matching optimistic echo instead of
        // duplicating it.
        if let Some(idx) = self
            .pending
            .iter()
            .position(|p| p.to_id == message.to_id && p.content == message.content)
        {
            let echo = self.pending.remove(idx);
            if let Some(slot) = self.conversation.iter_mut().find(|m| m.id == echo.local_id) {
                *slot = message;
            }
            return;
        }
        // No echo to reconcile (e.g. sent before a view switch); append if it
        // belongs to the active conversation and is not mirrored yet.
        if self.active_peer.as_ref() == Some(&message.to_id)
            && !self.conversation.iter().any(|m| m.id == message.id)
        {
            self.conversation.push(message);
        }
    }

    fn restore_pending_echoes(&mut self, peer_id: &UserId) {
        let Some(me) = self.me.as_ref() else {
            return;
        };
        for echo in self.pending.iter().filter(|p| &p.to_id == peer_id) {
            if !self.conversation.iter().any(|m| m.id == echo.local_id) {
                self.conversation.push(Message {
                    id: echo.local_id.clone(),
                    from_id: me.id.clone(),
                    to_id: echo.to_id.clone(),
                    content: echo.content.clone(),
                    timestamp: Utc::now(),
                    read: false,
                });
            }
        }
    }
}
