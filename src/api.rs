//! Admission API: the HTTP control surface
//!
//! A separate web backend authenticates the user out-of-band, then calls
//! these endpoints to mint a session before the browser opens the media
//! channel. Runs unified with the WebSocket surface on one port, so the
//! minted engine URL uses the /ws/ws/{session_id} double-prefix path.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::error::GatewayError;
use crate::gateway;
use crate::state::AppState;

/// Build the unified router: admission endpoints plus the message channel
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/sessions", post(create_session).get(list_sessions))
        .route(
            "/v1/sessions/:session_id",
            get(get_session).delete(delete_session),
        )
        .route("/v1/webrtc/config", get(webrtc_config))
        // Message channel; the double prefix is the unified-mode mount path
        .route("/ws/:connection_id", get(gateway::ws_handler))
        .route("/ws/ws/:connection_id", get(gateway::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Bodies
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    tutor_id: i64,
    student_id: i64,
    #[serde(default)]
    kb_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateSessionResponse {
    session_id: String,
    engine_url: String,
    engine_token: String,
    status: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.registry.sweep();
    Json(json!({
        "status": "healthy",
        "service": "Inference Engine Gateway",
        "active_sessions": state.registry.active_count(),
        "max_sessions": state.registry.max_sessions(),
        "active_connections": state.connections.count(),
        "media_sessions": state.transport.session_count().await,
    }))
}

async fn create_session(
    State(state): State<AppState>,
    body: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Result<Response, GatewayError> {
    let Json(request) = body
        .map_err(|e| GatewayError::MalformedRequest(format!("invalid session body: {e}")))?;

    let session = state
        .registry
        .create(request.tutor_id, request.student_id, request.kb_id)?;

    let response = CreateSessionResponse {
        engine_url: state.config.engine_url(&session.session_id),
        engine_token: session.engine_token.clone(),
        status: session.status.to_string(),
        session_id: session.session_id,
    };
    Ok((StatusCode::CREATED, Json(response)).into_response())
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Response, GatewayError> {
    let session = state
        .registry
        .get(&session_id)
        .ok_or_else(|| GatewayError::NotFound(format!("Session {session_id}")))?;
    Ok(Json(session.snapshot()).into_response())
}

async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Response, GatewayError> {
    if !state.registry.delete(&session_id) {
        return Err(GatewayError::NotFound(format!("Session {session_id}")));
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn list_sessions(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sessions = state.registry.list();
    Json(json!({
        "total": sessions.len(),
        "sessions": sessions,
    }))
}

/// ICE-server descriptor the browser feeds to its RTCPeerConnection. The
/// transport policy mirrors the gateway's own relay-only stance.
async fn webrtc_config(State(state): State<AppState>) -> Json<serde_json::Value> {
    let webrtc = &state.config.webrtc;
    Json(json!({
        "iceServers": [
            { "urls": [webrtc.stun_server] },
            {
                "urls": [webrtc.turn_server],
                "username": webrtc.turn_username,
                "credential": webrtc.turn_password,
            },
        ],
        "iceTransportPolicy": "relay",
        "publicIp": webrtc.public_ip,
        "portRange": [webrtc.port_min, webrtc.port_max],
        "sdpSemantics": "unified-plan",
    }))
}
