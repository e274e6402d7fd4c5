use log::{debug, info};

use crate::error::ChatError;
use crate::state::send_event;
use crate::{ChannelSender, ClientFrame, ServerEvent, SharedState, UserId};

/// Handle one inbound frame from a bound delivery channel. Validation errors
/// are returned so the connection loop can surface them as `error` events;
/// push failures to other identities are not errors (the polling backstop
/// covers missed pushes).
pub async fn handle_frame(
    frame: ClientFrame,
    user_id: &UserId,
    state: &SharedState,
    sender: &ChannelSender,
) -> Result<(), ChatError> {
    match frame {
        ClientFrame::Send { to_id, content } => {
            {
                let registry = state.registry.read().await;
                if !registry.contains(&to_id) {
                    return Err(ChatError::NotFound(format!("identity {}", to_id)));
                }
            }

            let msg = {
                let store = state.store.lock().await;
                store.append(user_id, &to_id, &content)?
            };
            info!("Message {} from {} to {}", msg.id, user_id, to_id);

            // The append is durable; a lost push never rolls it back.
            let delivered = state
                .push_to_user(&to_id, &ServerEvent::NewMessage { message: msg.clone() })
                .await;
            if !delivered {
                debug!("Recipient {} has no channel; message awaits poll", to_id);
            }

            send_event(sender, &ServerEvent::MessageSent { message: msg });
            Ok(())
        }

        ClientFrame::Read { message_id } => {
            let msg = {
                let store = state.store.lock().await;
                store.mark_read(&message_id, user_id)?
            };
            // Receipt goes out only after the read write is durable.
            state
                .push_to_user(
                    &msg.from_id,
                    &ServerEvent::MessageRead {
                        message_id: msg.id,
                        reader_id: user_id.clone(),
                    },
                )
                .await;
            Ok(())
        }

        ClientFrame::ReadConversation { peer_id } => {
            let marked = {
                let store = state.store.lock().await;
                store.mark_conversation_read(user_id, &peer_id)?
            };
            for message_id in marked {
                state
                    .push_to_user(
                        &peer_id,
                        &ServerEvent::MessageRead {
                            message_id,
                            reader_id: user_id.clone(),
                        },
                    )
                    .await;
            }
            Ok(())
        }

        ClientFrame::Typing { to_id } => {
            state
                .push_to_user(
                    &to_id,
                    &ServerEvent::Typing {
                        from_id: user_id.clone(),
                    },
                )
                .await;
            Ok(())
        }

        ClientFrame::Ping => {
            send_event(sender, &ServerEvent::Pong);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::{recv_event, test_state};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_send_delivers_and_echoes() {
        let state = Arc::new(test_state());
        let alice = state.register_identity("alice", None).await.unwrap();
        let bob = state.register_identity("bob", None).await.unwrap();

        let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        state.open_session(&alice.id, &"c1".to_string(), alice_tx.clone()).await.unwrap();
        state.open_session(&bob.id, &"c2".to_string(), bob_tx).await.unwrap();
        let _ = recv_event(&mut alice_rx); // snapshot
        let _ = recv_event(&mut alice_rx); // bob online
        let _ = recv_event(&mut bob_rx); // snapshot

        handle_frame(
            ClientFrame::Send {
                to_id: bob.id.clone(),
                content: "hi".to_string(),
            },
            &alice.id,
            &state,
            &alice_tx,
        )
        .await
        .unwrap();

        let pushed = match recv_event(&mut bob_rx) {
            ServerEvent::NewMessage { message } => {
                assert_eq!(message.content, "hi");
                assert_eq!(message.from_id, alice.id);
                assert!(!message.read);
                message
            }
            other => panic!("unexpected event: {:?}", other),
        };
        match recv_event(&mut alice_rx) {
            ServerEvent::MessageSent { message } => assert_eq!(message.id, pushed.id),
            other => panic!("unexpected event: {:?}", other),
        }

        // Durable regardless of push outcome.
        let store = state.store.lock().await;
        let conv = store.list_conversation(&alice.id, &bob.id).unwrap();
        assert_eq!(conv.len(), 1);
        assert_eq!(conv[0].id, pushed.id);
    }

    #[tokio::test]
    async fn test_send_to_unknown_identity_fails() {
        let state = Arc::new(test_state());
        let alice = state.register_identity("alice", None).await.unwrap();
        let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
        state.open_session(&alice.id, &"c1".to_string(), alice_tx.clone()).await.unwrap();
        let _ = recv_event(&mut alice_rx);

        let err = handle_frame(
            ClientFrame::Send {
                to_id: "ghost".to_string(),
                content: "hi".to_string(),
            },
            &alice.id,
            &state,
            &alice_tx,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_send_to_offline_recipient_still_stores() {
        let state = Arc::new(test_state());
        let alice = state.register_identity("alice", None).await.unwrap();
        let bob = state.register_identity("bob", None).await.unwrap();
        let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
        state.open_session(&alice.id, &"c1".to_string(), alice_tx.clone()).await.unwrap();
        let _ = recv_event(&mut alice_rx);

        handle_frame(
            ClientFrame::Send {
                to_id: bob.id.clone(),
                content: "hello?".to_string(),
            },
            &alice.id,
            &state,
            &alice_tx,
        )
        .await
        .unwrap();

        // Sender still gets the echo; the message waits in the store.
        assert!(matches!(recv_event(&mut alice_rx), ServerEvent::MessageSent { .. }));
        let store = state.store.lock().await;
        assert_eq!(store.list_conversation(&alice.id, &bob.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_read_receipt_scenario() {
        let state = Arc::new(test_state());
        let alice = state.register_identity("alice", None).await.unwrap();
        let bob = state.register_identity("bob", None).await.unwrap();

        let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        state.open_session(&alice.id, &"c1".to_string(), alice_tx.clone()).await.unwrap();
        state.open_session(&bob.id, &"c2".to_string(), bob_tx.clone()).await.unwrap();
        let _ = recv_event(&mut alice_rx);
        let _ = recv_event(&mut alice_rx);
        let _ = recv_event(&mut bob_rx);

        handle_frame(
            ClientFrame::Send {
                to_id: bob.id.clone(),
                content: "hi".to_string(),
            },
            &alice.id,
            &state,
            &alice_tx,
        )
        .await
        .unwrap();
        let msg = match recv_event(&mut bob_rx) {
            ServerEvent::NewMessage { message } => message,
            other => panic!("unexpected event: {:?}", other),
        };
        let _ = recv_event(&mut alice_rx); // message_sent

        // Alice (the sender) may not mark it read.
        let err = handle_frame(
            ClientFrame::Read {
                message_id: msg.id.clone(),
            },
            &alice.id,
            &state,
            &alice_tx,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ChatError::Forbidden));

        // Bob may; alice then receives the receipt.
        handle_frame(
            ClientFrame::Read {
                message_id: msg.id.clone(),
            },
            &bob.id,
            &state,
            &bob_tx,
        )
        .await
        .unwrap();
        match recv_event(&mut alice_rx) {
            ServerEvent::MessageRead { message_id, reader_id } => {
                assert_eq!(message_id, msg.id);
                assert_eq!(reader_id, bob.id);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_conversation_fans_out_receipts() {
        let state = Arc::new(test_state());
        let alice = state.register_identity("alice", None).await.unwrap();
        let bob = state.register_identity("bob", None).await.unwrap();

        let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        state.open_session(&alice.id, &"c1".to_string(), alice_tx.clone()).await.unwrap();
        state.open_session(&bob.id, &"c2".to_string(), bob_tx.clone()).await.unwrap();
        let _ = recv_event(&mut alice_rx);
        let _ = recv_event(&mut alice_rx);
        let _ = recv_event(&mut bob_rx);

        for text in ["one", "two"] {
            handle_frame(
                ClientFrame::Send {
                    to_id: bob.id.clone(),
                    content: text.to_string(),
                },
                &alice.id,
                &state,
                &alice_tx,
            )
            .await
            .unwrap();
            let _ = recv_event(&mut alice_rx);
            let _ = recv_event(&mut bob_rx);
        }

        handle_frame(
            ClientFrame::ReadConversation {
                peer_id: alice.id.clone(),
            },
            &bob.id,
            &state,
            &bob_tx,
        )
        .await
        .unwrap();

        // One receipt per message, oldest first.
        let mut receipts = 0;
        while let Ok(frame) = alice_rx.try_recv() {
            if let axum::extract::ws::Message::Text(json) = frame {
                if let Ok(ServerEvent::MessageRead { reader_id, .. }) = serde_json::from_str(&json) {
                    assert_eq!(reader_id, bob.id);
                    receipts += 1;
                }
            }
        }
        assert_eq!(receipts, 2);
    }

    #[tokio::test]
    async fn test_typing_relay_and_ping() {
        let state = Arc::new(test_state());
        let alice = state.register_identity("alice", None).await.unwrap();
        let bob = state.register_identity("bob", None).await.unwrap();

        let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        state.open_session(&alice.id, &"c1".to_string(), alice_tx.clone()).await.unwrap();
        state.open_session(&bob.id, &"c2".to_string(), bob_tx).await.unwrap();
        let _ = recv_event(&mut alice_rx);
        let _ = recv_event(&mut alice_rx);
        let _ = recv_event(&mut bob_rx);

        handle_frame(
            ClientFrame::Typing { to_id: bob.id.clone() },
            &alice.id,
            &state,
            &alice_tx,
        )
        .await
        .unwrap();
        match recv_event(&mut bob_rx) {
            ServerEvent::Typing { from_id } => assert_eq!(from_id, alice.id),
            other => panic!("unexpected event: {:?}", other),
        }

        handle_frame(ClientFrame::Ping, &alice.id, &state, &alice_tx).await.unwrap();
        assert!(matches!(recv_event(&mut alice_rx), ServerEvent::Pong));
    }
}
