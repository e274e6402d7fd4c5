use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    Json,
};
use log::info;
use serde::Deserialize;

use crate::error::ChatError;
use crate::{ServerEvent, SharedState, UserId};

fn error_response(e: &ChatError) -> Response {
    (e.status_code(), e.to_string()).into_response()
}

// ---------- Identities ----------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub display_name: String,
    #[serde(default)]
    pub account_id: Option<String>,
}

/// The `register` operation. Re-posting a known accountId is an idempotent
/// re-login that keeps the identity id stable.
pub async fn register_user(
    State(state): State<SharedState>,
    Json(req): Json<RegisterRequest>,
) -> Response {
    match state.register_identity(&req.display_name, req.account_id).await {
        Ok(identity) => {
            info!("Registered {} as {}", identity.display_name, identity.id);
            Json(identity).into_response()
        }
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListUsersQuery {
    /// Identity id to leave out of the listing (the caller itself).
    #[serde(default)]
    pub exclude: Option<UserId>,
}

/// The `listIdentities` operation; also the client's presence poll backstop.
pub async fn get_users(
    State(state): State<SharedState>,
    Query(query): Query<ListUsersQuery>,
) -> Response {
    let registry = state.registry.read().await;
    Json(registry.snapshot(query.exclude.as_ref())).into_response()
}

// ---------- Messages ----------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationQuery {
    pub user_id: UserId,
    pub other_user_id: UserId,
}

/// The `listConversation` operation; also the client's message poll
/// backstop. Unknown pairs yield an empty list.
pub async fn get_messages(
    State(state): State<SharedState>,
    Query(query): Query<ConversationQuery>,
) -> Response {
    let store = state.store.lock().await;
    match store.list_conversation(&query.user_id, &query.other_user_id) {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadQuery {
    pub user_id: UserId,
}

/// Unread counts per sender, for rebuilding badges after reconnect.
pub async fn get_unread_counts(
    State(state): State<SharedState>,
    Query(query): Query<UnreadQuery>,
) -> Response {
    let store = state.store.lock().await;
    match store.unread_counts(&query.user_id) {
        Ok(counts) => Json(counts).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadRequest {
    pub reader_id: UserId,
}

/// The `markRead` operation over REST (the WS `read` frame is equivalent).
/// The receipt is pushed to the sender only after the write is durable.
pub async fn mark_read(
    State(state): State<SharedState>,
    Path(message_id): Path<String>,
    Json(req): Json<MarkReadRequest>,
) -> Response {
    let msg = {
        let store = state.store.lock().await;
        match store.mark_read(&message_id, &req.reader_id) {
            Ok(msg) => msg,
            Err(e) => return error_response(&e),
        }
    };

    state
        .push_to_user(
            &msg.from_id,
            &ServerEvent::MessageRead {
                message_id: msg.id.clone(),
                reader_id: req.reader_id,
            },
        )
        .await;

    Json(msg).into_response()
}

// ---------- Status ----------

pub async fn get_status(State(state): State<SharedState>) -> Response {
    let connections = {
        let channels = state.channels.read().await;
        channels.len()
    };
    let identities = {
        let registry = state.registry.read().await;
        registry.identities.len()
    };
    Json(serde_json::json!({
        "connections": connections,
        "identities": identities,
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
    .into_response()
}
