use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{http::StatusCode, routing::get, routing::post, Router};
use chrono::{DateTime, Utc};
use log::{error, info};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

pub mod client;
pub mod error;
pub mod handlers;
pub mod security;
pub mod state;

use security::{build_cors_layer, ConnectionTracker, KeyedRateLimiter, SecurityConfig};
use state::store::MessageStore;
use state::AppState;

pub type UserId = String;
pub type ConnId = String;
/// Per-channel outbound queue. Senders are cloned into shared state so events
/// can be pushed without holding the socket itself.
pub type ChannelSender = mpsc::UnboundedSender<axum::extract::ws::Message>;

pub type SharedState = Arc<AppState>;

// ============================================
// Core data model
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Offline,
}

/// How an identity was created: a throwaway per-session name, or a re-login
/// against a durable account id (idempotent across reconnects).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdentityOrigin {
    Ephemeral,
    AccountBound {
        #[serde(rename = "accountId")]
        account_id: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: UserId,
    pub display_name: String,
    pub origin: IdentityOrigin,
    pub status: Presence,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub from_id: UserId,
    pub to_id: UserId,
    pub content: String,
    /// Server-assigned; client-supplied timestamps are never trusted.
    pub timestamp: DateTime<Utc>,
    pub read: bool,
}

// ============================================
// Wire protocol
// ============================================

/// Frames a client sends over its delivery channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Send a direct message. The server assigns id and timestamp.
    #[serde(rename_all = "camelCase")]
    Send { to_id: UserId, content: String },
    /// Mark a single received message as read.
    #[serde(rename_all = "camelCase")]
    Read { message_id: String },
    /// Mark every unread message from a peer as read (conversation opened).
    #[serde(rename_all = "camelCase")]
    ReadConversation { peer_id: UserId },
    /// Typing indicator, relayed to the peer. Not persisted.
    #[serde(rename_all = "camelCase")]
    Typing { to_id: UserId },
    /// Keepalive; any inbound frame resets the idle deadline.
    Ping,
}

/// Reason a delivery channel was closed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LostReason {
    Superseded,
    IdleTimeout,
    TransportFailure,
}

/// Events the server pushes over a delivery channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A stored message addressed to this channel's identity.
    NewMessage { message: Message },
    /// Echo of this identity's own send, after the append is durable.
    MessageSent { message: Message },
    /// The recipient marked one of this identity's messages as read.
    #[serde(rename_all = "camelCase")]
    MessageRead { message_id: String, reader_id: UserId },
    /// Presence change of another identity.
    #[serde(rename_all = "camelCase")]
    UserStatus {
        user_id: UserId,
        status: Presence,
        last_seen: DateTime<Utc>,
    },
    /// A peer is typing in the conversation with this identity.
    #[serde(rename_all = "camelCase")]
    Typing { from_id: UserId },
    /// Sent once on channel open; the client's initial identity mirror.
    IdentitySnapshot { identities: Vec<Identity> },
    /// Local-only: this channel is gone. Never delivered to peers.
    ConnectionLost { reason: LostReason },
    Error { message: String },
    Pong,
}

// ============================================
// Configuration
// ============================================

/// Relay configuration from environment. Security limits live in
/// security::SecurityConfig.
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    pub db_path: String,
    /// Channels with no inbound frames for this long are closed through the
    /// normal disconnect path.
    pub idle_timeout: Duration,
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let bind_addr = env::var("RELAY_BIND_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| "0.0.0.0:8080".parse().expect("default addr"));

        let db_path = env::var("RELAY_DB_PATH").unwrap_or_else(|_| "data/relay.db".to_string());

        let idle_secs = env::var("RELAY_IDLE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(120);

        Self {
            bind_addr,
            db_path,
            idle_timeout: Duration::from_secs(idle_secs),
        }
    }
}

// ============================================
// Main entry point
// ============================================

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = RelayConfig::from_env();
    let security = SecurityConfig::from_env();

    if let Some(parent) = std::path::Path::new(&config.db_path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let store = match MessageStore::open(&config.db_path) {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open message store at {}: {}", config.db_path, e);
            std::process::exit(1);
        }
    };

    // Identities survive restarts (as Offline) so stored conversations stay
    // addressable.
    let known = match store.load_identities() {
        Ok(ids) => ids,
        Err(e) => {
            error!("Failed to load identities: {}", e);
            Vec::new()
        }
    };
    info!("Loaded {} known identities", known.len());

    let tracker = Arc::new(tokio::sync::RwLock::new(ConnectionTracker::new(
        security.max_ws_connections,
        security.max_ws_per_ip,
    )));
    let ws_rate_limiter = security
        .ws_msgs_per_sec
        .map(KeyedRateLimiter::new)
        .map(Arc::new);

    let state = Arc::new(AppState::new(
        store,
        known,
        config.idle_timeout,
        tracker,
        ws_rate_limiter,
    ));

    let app = Router::new()
        .route("/api/users/register", post(handlers::http::register_user))
        .route("/api/users", get(handlers::http::get_users))
        .route("/api/messages", get(handlers::http::get_messages))
        .route("/api/messages/unread", get(handlers::http::get_unread_counts))
        .route("/api/messages/:id/read", post(handlers::http::mark_read))
        .route("/api/status", get(handlers::http::get_status))
        .route("/health", get(|| async { "ok" }))
        .route("/ws", get(handlers::ws::ws_handler))
        .fallback(|| async { (StatusCode::NOT_FOUND, "Not found. Use /health, /api/*, or /ws.") })
        .layer(axum::middleware::from_fn(security::client_ip_middleware))
        .layer(build_cors_layer(&security))
        .layer(RequestBodyLimitLayer::new(security.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(&config.bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind {}: {}", config.bind_addr, e);
            std::process::exit(1);
        }
    };
    info!("Relay listening on http://{}", config.bind_addr);
    info!("WebSocket endpoint: ws://{}/ws?userId=<id>", config.bind_addr);

    let graceful = axum::serve(listener, app).with_graceful_shutdown(async {
        tokio::signal::ctrl_c().await.ok();
    });

    if let Err(e) = graceful.await {
        error!("Server error: {}", e);
    }
}
