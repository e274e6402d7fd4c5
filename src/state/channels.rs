use std::collections::HashMap;

use crate::{ChannelSender, ConnId, UserId};

/// A live delivery channel binding. At most one per identity.
#[derive(Clone)]
pub struct ChannelBinding {
    pub conn_id: ConnId,
    pub sender: ChannelSender,
}

/// Directory of identity -> delivery channel. Exclusive on bind/unbind,
/// many-readers for fan-out.
pub struct ChannelDirectory {
    bindings: HashMap<UserId, ChannelBinding>,
}

impl ChannelDirectory {
    pub fn new() -> Self {
        Self {
            bindings: HashMap::new(),
        }
    }

    /// Bind a channel for an identity. Last-connect-wins: returns the
    /// superseded binding, if any, so the caller can notify and close it.
    pub fn bind(&mut self, user_id: UserId, conn_id: ConnId, sender: ChannelSender) -> Option<ChannelBinding> {
        self.bindings.insert(user_id, ChannelBinding { conn_id, sender })
    }

    /// Unbind only if this connection still owns the binding. A superseded
    /// connection's cleanup must not tear down its successor.
    pub fn unbind(&mut self, user_id: &UserId, conn_id: &ConnId) -> bool {
        match self.bindings.get(user_id) {
            Some(binding) if &binding.conn_id == conn_id => {
                self.bindings.remove(user_id);
                true
            }
            _ => false,
        }
    }

    pub fn sender_for(&self, user_id: &UserId) -> Option<ChannelSender> {
        self.bindings.get(user_id).map(|b| b.sender.clone())
    }

    /// Senders for every bound identity except one (presence fan-out).
    pub fn all_except(&self, user_id: &UserId) -> Vec<ChannelSender> {
        self.bindings
            .iter()
            .filter(|(id, _)| *id != user_id)
            .map(|(_, b)| b.sender.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn channel() -> (ChannelSender, mpsc::UnboundedReceiver<axum::extract::ws::Message>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn test_bind_supersedes_previous() {
        let mut dir = ChannelDirectory::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();

        assert!(dir.bind("alice".into(), "conn-1".into(), tx1).is_none());
        let old = dir.bind("alice".into(), "conn-2".into(), tx2).unwrap();
        assert_eq!(old.conn_id, "conn-1");
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_stale_unbind_is_a_noop() {
        let mut dir = ChannelDirectory::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();

        dir.bind("alice".into(), "conn-1".into(), tx1);
        dir.bind("alice".into(), "conn-2".into(), tx2);

        // The superseded connection's cleanup runs late; the new binding stays.
        assert!(!dir.unbind(&"alice".to_string(), &"conn-1".to_string()));
        assert!(dir.sender_for(&"alice".to_string()).is_some());

        assert!(dir.unbind(&"alice".to_string(), &"conn-2".to_string()));
        assert!(dir.sender_for(&"alice".to_string()).is_none());
    }

    #[test]
    fn test_all_except_skips_subject() {
        let mut dir = ChannelDirectory::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        dir.bind("alice".into(), "c1".into(), tx1);
        dir.bind("bob".into(), "c2".into(), tx2);

        assert_eq!(dir.all_except(&"alice".to_string()).len(), 1);
        assert_eq!(dir.all_except(&"carol".to_string()).len(), 2);
    }
}
