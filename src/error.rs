//! Gateway error taxonomy and HTTP response mapping

use axum::{
    body::Body,
    http::{Response, StatusCode},
    response::IntoResponse,
};
use serde_json::json;

/// Errors surfaced by the gateway surfaces.
///
/// Admission errors map to HTTP status codes; message-channel errors become
/// `{type:"error"}` replies on the open connection. Pipeline drops are
/// observability-only and never reach a client.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Admission refused; retryable once a session terminates
    #[error("maximum sessions ({0}) reached")]
    CapacityExhausted(usize),

    /// Session id or avatar id unknown
    #[error("{0} not found")]
    NotFound(String),

    /// Bearer token absent, invalid, or mismatched
    #[error("invalid or missing token")]
    Unauthenticated,

    /// Schema violation in a request or message
    #[error("{0}")]
    MalformedRequest(String),

    /// A collaborator (LLM / ASR / TTS / lip-sync model) failed
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// Underlying channel or media session unrecoverably closed
    #[error("transport closed: {0}")]
    TransportFatal(String),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response<Body> {
        let status = match &self {
            GatewayError::CapacityExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Unauthenticated => StatusCode::UNAUTHORIZED,
            GatewayError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::TransportFatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        tracing::error!("API error: {} - {}", status, self);

        let body = json!({ "detail": self.to_string() }).to_string();
        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap_or_else(|_| Response::new(Body::from("internal error building error response")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_admission_contract() {
        assert_eq!(
            GatewayError::CapacityExhausted(10).into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::NotFound("session abc".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::MalformedRequest("bad body".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn error_messages_are_client_readable() {
        assert_eq!(
            GatewayError::CapacityExhausted(10).to_string(),
            "maximum sessions (10) reached"
        );
        assert_eq!(
            GatewayError::NotFound("Session abc".into()).to_string(),
            "Session abc not found"
        );
    }
}
