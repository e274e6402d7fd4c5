use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::handlers::message::handle_frame;
use crate::security::ClientIp;
use crate::state::send_event;
use crate::{ClientFrame, ConnId, LostReason, ServerEvent, SharedState, UserId};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    user_id: UserId,
}

/// Delivery-channel endpoint. The identity must already be registered; the
/// bind itself (and any supersession) happens after the upgrade.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<SharedState>,
    Extension(ClientIp(client_ip)): Extension<ClientIp>,
) -> axum::response::Response {
    {
        let tracker = state.connection_tracker.read().await;
        if !tracker.can_accept(&client_ip) {
            return (StatusCode::SERVICE_UNAVAILABLE, "Connection limit reached").into_response();
        }
    }
    {
        let registry = state.registry.read().await;
        if !registry.contains(&query.user_id) {
            return (StatusCode::NOT_FOUND, "Unknown identity; register first").into_response();
        }
    }
    ws.on_upgrade(move |socket| handle_connection(socket, state, query.user_id, client_ip))
}

async fn handle_connection(socket: WebSocket, state: SharedState, user_id: UserId, client_ip: String) {
    if state.connection_tracker.write().await.try_register(&client_ip).is_err() {
        return;
    }

    let conn_id: ConnId = uuid::Uuid::new_v4().to_string();
    info!("Delivery channel open for {} ({})", user_id, conn_id);

    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    if let Err(e) = state.open_session(&user_id, &conn_id, tx.clone()).await {
        warn!("Failed to open session for {}: {}", user_id, e);
        send_task.abort();
        state.connection_tracker.write().await.unregister(&client_ip);
        return;
    }

    loop {
        let next = tokio::select! {
            next = tokio::time::timeout(state.idle_timeout, ws_receiver.next()) => next,
            _ = &mut send_task => break,
        };

        let msg_opt = match next {
            Ok(msg_opt) => msg_opt,
            Err(_) => {
                // No inbound frames within the idle window: close through the
                // same path as an explicit disconnect.
                info!("Idle timeout for {} ({})", user_id, conn_id);
                send_event(
                    &tx,
                    &ServerEvent::ConnectionLost {
                        reason: LostReason::IdleTimeout,
                    },
                );
                let _ = tx.send(WsMessage::Close(None));
                break;
            }
        };

        match msg_opt {
            Some(Ok(WsMessage::Text(text))) => {
                if let Some(ref limiter) = state.ws_rate_limiter {
                    if !limiter.check_key(&client_ip) {
                        send_event(
                            &tx,
                            &ServerEvent::Error {
                                message: "Rate limit exceeded".to_string(),
                            },
                        );
                        continue;
                    }
                }
                match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => {
                        if let Err(e) = handle_frame(frame, &user_id, &state, &tx).await {
                            warn!("Error handling frame from {}: {}", user_id, e);
                            send_event(&tx, &ServerEvent::Error { message: e.to_string() });
                        }
                    }
                    Err(e) => {
                        warn!("Failed to parse frame from {}: {}", user_id, e);
                        send_event(
                            &tx,
                            &ServerEvent::Error {
                                message: format!("Invalid frame format: {}", e),
                            },
                        );
                    }
                }
            }
            Some(Ok(WsMessage::Close(_))) => {
                info!("Client {} closed channel {}", user_id, conn_id);
                break;
            }
            Some(Ok(WsMessage::Ping(data))) => {
                let _ = tx.send(WsMessage::Pong(data));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!("WebSocket error on channel {}: {}", conn_id, e);
                break;
            }
            None => break,
        }
    }

    // Supersession-safe: close_session is a no-op if a newer connection
    // already owns the binding.
    state.close_session(&user_id, &conn_id).await;
    send_task.abort();
    state.connection_tracker.write().await.unregister(&client_ip);
}
