// Connection gateway: the bidirectional message channel
//
// Connections come in two shapes:
//   session-scoped  /ws/{session_id}?token=...   one channel per session,
//                   token mandatory and must verify to that session
//   user-scoped     /ws/user_{uid}[?token=...]   one channel shared by all
//                   of the user's sessions; token optional, a valid one
//                   selects the default session context
//
// After the handshake the loop is uniform: decode JSON, touch the session,
// dispatch to the router. Decode and handler errors become error replies on
// the open connection; only a transport failure ends the loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::engine::Engine;
use crate::state::AppState;

pub mod messages;
pub mod router;

use messages::{Inbound, Outbound};

// ─────────────────────────────────────────────────────────────────────────────
// Connection identity
// ─────────────────────────────────────────────────────────────────────────────

/// How a connection is scoped, decoded from the path segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionMode {
    /// `user_{uid}` / `user:{uid}`: shared across the user's sessions
    UserScoped { user_id: String },
    /// Anything else is a session id
    SessionScoped { session_id: String },
}

impl ConnectionMode {
    pub fn parse(connection_id: &str) -> Self {
        for prefix in ["user_", "user:"] {
            if let Some(uid) = connection_id.strip_prefix(prefix) {
                return Self::UserScoped {
                    user_id: uid.to_string(),
                };
            }
        }
        let session_id = connection_id
            .strip_prefix("session:")
            .unwrap_or(connection_id);
        Self::SessionScoped {
            session_id: session_id.to_string(),
        }
    }
}

/// Media-transport key for an explicit user id in a message; all of a
/// user's sessions share one media session
pub fn media_key_for_user(user_id: i64) -> String {
    format!("user_{user_id}")
}

// ─────────────────────────────────────────────────────────────────────────────
// Live connections and session contexts
// ─────────────────────────────────────────────────────────────────────────────

/// Cached routing context for one engine session on a user-scoped connection
#[derive(Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub tutor_id: i64,
    pub kb_id: Option<String>,
    pub engine: Arc<Engine>,
}

/// Live-connection map plus the per-session contexts that survive
/// reconnects of user-scoped channels
#[derive(Default)]
pub struct Connections {
    live: Mutex<HashMap<String, mpsc::UnboundedSender<Outbound>>>,
    contexts: Mutex<HashMap<String, SessionContext>>,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's outbound queue. A second connection for the
    /// same id supersedes the first in the map.
    fn register(&self, connection_id: &str, tx: mpsc::UnboundedSender<Outbound>) {
        let replaced = self
            .live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(connection_id.to_string(), tx)
            .is_some();
        if replaced {
            tracing::info!(connection_id, "Connection superseded an existing one");
        }
    }

    /// Remove a connection if the registered queue is still ours (a
    /// superseding connection keeps its own entry)
    fn unregister(&self, connection_id: &str, tx: &mpsc::UnboundedSender<Outbound>) {
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        if live
            .get(connection_id)
            .map(|current| current.same_channel(tx))
            .unwrap_or(false)
        {
            live.remove(connection_id);
        }
    }

    pub fn count(&self) -> usize {
        self.live.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn context(&self, session_id: &str) -> Option<SessionContext> {
        self.contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
    }

    pub fn store_context(&self, context: SessionContext) {
        self.contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(context.session_id.clone(), context);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket endpoint
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// Upgrade handler for /ws/{connection_id} (and the unified-mode double
/// prefix /ws/ws/{connection_id})
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(connection_id): Path<String>,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, connection_id, query.token))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    connection_id: String,
    token: Option<String>,
) {
    let mode = ConnectionMode::parse(&connection_id);

    // Authenticate before anything is sent
    let default_session_id = match &mode {
        ConnectionMode::SessionScoped { session_id } => {
            let verified = token
                .as_deref()
                .and_then(|t| state.registry.verify(t))
                .filter(|verified| verified == session_id)
                .filter(|verified| state.registry.get(verified).is_some());

            match verified {
                Some(session_id) => Some(session_id),
                None => {
                    tracing::warn!(
                        connection_id,
                        "{} on session-scoped connection",
                        crate::error::GatewayError::Unauthenticated
                    );
                    close_policy_violation(socket).await;
                    return;
                }
            }
        }
        ConnectionMode::UserScoped { user_id } => {
            let verified = token.as_deref().and_then(|t| state.registry.verify(t));
            match (&token, &verified) {
                (Some(_), None) => {
                    tracing::warn!(user_id, "Invalid token provided, using sessionless mode")
                }
                (None, _) => tracing::info!(user_id, "No token provided, using sessionless mode"),
                (Some(_), Some(session_id)) => {
                    tracing::info!(user_id, session_id, "Token verified, using default session")
                }
            }
            verified
        }
    };

    let (mut socket_tx, mut socket_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
    state.connections.register(&connection_id, outbound_tx.clone());
    tracing::info!(connection_id, ?mode, "WebSocket connected");

    // Writer task: serialize replies in queue order
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("Failed to serialize outbound message: {e}");
                    continue;
                }
            };
            if socket_tx.send(Message::Text(json)).await.is_err() {
                break; // transport-fatal: reader side will observe the close
            }
        }
    });

    send_welcome(&state, &mode, default_session_id.as_deref(), &outbound_tx).await;

    // Message loop: decode, touch, dispatch
    while let Some(incoming) = socket_rx.next().await {
        let text = match incoming {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::debug!(
                    connection_id,
                    "{}",
                    crate::error::GatewayError::TransportFatal(e.to_string())
                );
                break;
            }
            Ok(_) => continue, // ping/pong/binary frames are not messages
        };

        let message: Inbound = match serde_json::from_str(&text) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(connection_id, "Invalid JSON: {e}");
                let _ = outbound_tx.send(Outbound::error("Invalid message format"));
                continue;
            }
        };

        router::handle_message(
            &state,
            &outbound_tx,
            &mode,
            default_session_id.as_deref(),
            message,
        )
        .await;
    }

    // Cleanup: drop the connection entry; user-scoped session contexts are
    // retained so the user can reconnect
    state.connections.unregister(&connection_id, &outbound_tx);
    drop(outbound_tx);
    let _ = writer.await;
    tracing::info!(connection_id, "WebSocket disconnected");
}

/// Session-scoped welcome: one idle clip when the avatar feature is up,
/// otherwise a textual greeting. User-scoped connections wait for the first
/// message to learn their avatar.
async fn send_welcome(
    state: &AppState,
    mode: &ConnectionMode,
    default_session_id: Option<&str>,
    outbound: &mpsc::UnboundedSender<Outbound>,
) {
    if !matches!(mode, ConnectionMode::SessionScoped { .. }) {
        return;
    }
    let Some(session) = default_session_id.and_then(|id| state.registry.get(id)) else {
        return;
    };

    if state.config.features.avatar {
        let avatar_id = format!("avatar_tutor_{}", session.tutor_id);
        let avatars = Arc::clone(&state.avatars);
        let clip = tokio::task::spawn_blocking(move || avatars.render_idle_clip(&avatar_id)).await;

        match clip {
            Ok(Ok(clip)) => {
                use base64::Engine as _;
                let encoded = base64::engine::general_purpose::STANDARD.encode(&clip);
                let _ = outbound.send(Outbound::video("", encoded));
                tracing::info!(tutor_id = session.tutor_id, "Idle video sent as welcome");
            }
            Ok(Err(e)) => {
                tracing::warn!("Failed to get idle video, skipping welcome clip: {e}");
            }
            Err(e) => tracing::error!("Idle clip task failed: {e}"),
        }
    } else {
        let _ = outbound.send(Outbound::text(format!(
            "Welcome! You are connected to your virtual tutor (tutor {}).",
            session.tutor_id
        )));
    }
}

async fn close_policy_violation(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: "invalid token".into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_mode_parsing() {
        assert_eq!(
            ConnectionMode::parse("user_42"),
            ConnectionMode::UserScoped {
                user_id: "42".into()
            }
        );
        assert_eq!(
            ConnectionMode::parse("user:42"),
            ConnectionMode::UserScoped {
                user_id: "42".into()
            }
        );
        assert_eq!(
            ConnectionMode::parse("session:abc"),
            ConnectionMode::SessionScoped {
                session_id: "abc".into()
            }
        );
        assert_eq!(
            ConnectionMode::parse("9e107d9d-e1a4-4e5c-a6f1-000000000000"),
            ConnectionMode::SessionScoped {
                session_id: "9e107d9d-e1a4-4e5c-a6f1-000000000000".into()
            }
        );
    }

    #[test]
    fn media_keys_group_by_user() {
        assert_eq!(media_key_for_user(7), "user_7");
        assert_eq!(media_key_for_user(42), "user_42");
    }

    #[test]
    fn register_supersedes_and_unregister_is_owner_checked() {
        let connections = Connections::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        connections.register("user_1", tx1.clone());
        assert_eq!(connections.count(), 1);

        // Second connection supersedes the first
        connections.register("user_1", tx2.clone());
        assert_eq!(connections.count(), 1);

        // The superseded connection's cleanup must not evict the new one
        connections.unregister("user_1", &tx1);
        assert_eq!(connections.count(), 1);

        connections.unregister("user_1", &tx2);
        assert_eq!(connections.count(), 0);
    }
}
