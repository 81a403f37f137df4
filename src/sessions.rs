// Session registry for the admission control plane
//
// Tracks every session minted by the admission API. Each session carries an
// opaque bearer token (`engine_token`) that the media channel presents on
// upgrade; the registry owns both the primary index (session_id -> Session)
// and the reverse token index, and the two are mutated together under one
// lock so a token can never outlive or precede its session.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::Engine as _;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use subtle::ConstantTimeEq;

use crate::error::GatewayError;

// ─────────────────────────────────────────────────────────────────────────────
// Core Types
// ─────────────────────────────────────────────────────────────────────────────

/// Current status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Session is live and accepting traffic
    Active,
    /// Session has not seen activity recently
    Idle,
    /// Session has been deleted or evicted
    Closed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Idle => write!(f, "idle"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// One minted session
///
/// `created_mono` / `last_activity` are monotonic so the idle sweep cannot be
/// confused by wall-clock adjustments; `created_at` is the wall-clock stamp
/// reported in API snapshots.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub tutor_id: i64,
    pub student_id: i64,
    pub kb_id: Option<String>,
    pub engine_token: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub created_mono: Instant,
    pub last_activity: Instant,
}

impl Session {
    /// API-facing snapshot with ISO-8601 timestamps
    pub fn snapshot(&self) -> SessionSnapshot {
        let idle_for = self.last_activity.elapsed();
        let last_activity_wall = Utc::now()
            - chrono::Duration::from_std(idle_for).unwrap_or_else(|_| chrono::Duration::zero());
        SessionSnapshot {
            session_id: self.session_id.clone(),
            tutor_id: self.tutor_id,
            student_id: self.student_id,
            kb_id: self.kb_id.clone(),
            status: self.status,
            created_at: self.created_at.to_rfc3339(),
            last_activity: last_activity_wall.to_rfc3339(),
        }
    }
}

/// Serializable view of a session returned by the admission API
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub tutor_id: i64,
    pub student_id: i64,
    pub kb_id: Option<String>,
    pub status: SessionStatus,
    pub created_at: String,
    pub last_activity: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

struct RegistryState {
    /// Primary index: session_id -> Session
    sessions: HashMap<String, Session>,
    /// Reverse index: engine_token -> session_id
    tokens: HashMap<String, String>,
}

/// Registry of live sessions with a global concurrency cap and idle eviction
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
    max_sessions: usize,
    timeout: Duration,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize, timeout: Duration) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                sessions: HashMap::new(),
                tokens: HashMap::new(),
            }),
            max_sessions,
            timeout,
        }
    }

    /// Mint a new session.
    ///
    /// Sweeps expired sessions first, then enforces the cap. The session id
    /// and bearer token both come from the OS entropy source; the token is
    /// 32 random bytes in the URL-safe alphabet (43 chars, no padding).
    pub fn create(
        &self,
        tutor_id: i64,
        student_id: i64,
        kb_id: Option<String>,
    ) -> Result<Session, GatewayError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        sweep_expired(&mut state, self.timeout);

        if state.sessions.len() >= self.max_sessions {
            return Err(GatewayError::CapacityExhausted(self.max_sessions));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let engine_token = generate_token();

        let now = Instant::now();
        let session = Session {
            session_id: session_id.clone(),
            tutor_id,
            student_id,
            kb_id,
            engine_token: engine_token.clone(),
            status: SessionStatus::Active,
            created_at: Utc::now(),
            created_mono: now,
            last_activity: now,
        };

        // Both indices are updated under the same lock hold
        state.sessions.insert(session_id.clone(), session.clone());
        state.tokens.insert(engine_token, session_id.clone());

        tracing::info!(
            session_id = %session_id,
            tutor_id,
            student_id,
            active = state.sessions.len(),
            "Session created"
        );

        Ok(session)
    }

    /// Look up a session by id
    pub fn get(&self, session_id: &str) -> Option<Session> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.sessions.get(session_id).cloned()
    }

    /// Resolve a bearer token to its session id.
    ///
    /// The token index is scanned end to end with constant-time comparisons;
    /// there is no early exit, so the lookup cost does not depend on how much
    /// of a presented token matches a live one.
    pub fn verify(&self, token: &str) -> Option<String> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut found = None;
        for (candidate, session_id) in &state.tokens {
            if bool::from(candidate.as_bytes().ct_eq(token.as_bytes())) {
                found = Some(session_id.clone());
            }
        }
        found
    }

    /// Refresh a session's last-activity stamp
    pub fn touch(&self, session_id: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.last_activity = Instant::now();
            session.status = SessionStatus::Active;
        }
    }

    /// Remove a session and its token. Idempotent: deleting an unknown id
    /// returns false and has no other effect.
    pub fn delete(&self, session_id: &str) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.sessions.remove(session_id) {
            Some(mut session) => {
                session.status = SessionStatus::Closed;
                state.tokens.remove(&session.engine_token);
                tracing::info!(session_id = %session_id, status = %session.status, "Session deleted");
                true
            }
            None => false,
        }
    }

    /// Drop every session idle longer than the configured timeout.
    /// Best-effort: failures here are silent by design of the sweep contract.
    pub fn sweep(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        sweep_expired(&mut state, self.timeout);
    }

    /// Snapshots of all live sessions, sweeping expired ones first
    pub fn list(&self) -> Vec<SessionSnapshot> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        sweep_expired(&mut state, self.timeout);
        state.sessions.values().map(Session::snapshot).collect()
    }

    /// Number of live sessions
    pub fn active_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.sessions.len()
    }

    /// Configured admission cap
    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }
}

fn sweep_expired(state: &mut RegistryState, timeout: Duration) {
    // Mark sessions idle at half the eviction threshold so snapshots show
    // the transition before the session disappears
    let idle_after = timeout / 2;
    for session in state.sessions.values_mut() {
        if session.status == SessionStatus::Active && session.last_activity.elapsed() > idle_after {
            session.status = SessionStatus::Idle;
        }
    }

    let expired: Vec<String> = state
        .sessions
        .iter()
        .filter(|(_, s)| s.last_activity.elapsed() > timeout)
        .map(|(id, _)| id.clone())
        .collect();

    for session_id in expired {
        if let Some(mut session) = state.sessions.remove(&session_id) {
            session.status = SessionStatus::Closed;
            state.tokens.remove(&session.engine_token);
            tracing::info!(
                session_id = %session_id,
                age_secs = session.created_mono.elapsed().as_secs(),
                "Session evicted after idle timeout"
            );
        }
    }
}

/// 32 bytes from the OS entropy source, URL-safe base64 without padding
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(cap: usize) -> SessionRegistry {
        SessionRegistry::new(cap, Duration::from_secs(3600))
    }

    #[test]
    fn create_then_get_round_trips_fields() {
        let reg = registry(4);
        let created = reg.create(9, 42, Some("kb-7".into())).unwrap();

        let fetched = reg.get(&created.session_id).unwrap();
        assert_eq!(fetched.tutor_id, 9);
        assert_eq!(fetched.student_id, 42);
        assert_eq!(fetched.kb_id.as_deref(), Some("kb-7"));
        assert_eq!(fetched.status, SessionStatus::Active);
        assert!(fetched.last_activity >= fetched.created_mono);
    }

    #[test]
    fn token_has_token_urlsafe_length_and_verifies() {
        let reg = registry(4);
        let session = reg.create(1, 2, None).unwrap();

        // 32 random bytes -> 43 chars of unpadded base64
        assert_eq!(session.engine_token.len(), 43);
        assert_eq!(
            reg.verify(&session.engine_token).as_deref(),
            Some(session.session_id.as_str())
        );
        assert_eq!(reg.verify("not-a-token"), None);
    }

    #[test]
    fn tokens_are_unique_per_session() {
        let reg = registry(8);
        let a = reg.create(1, 1, None).unwrap();
        let b = reg.create(1, 2, None).unwrap();
        assert_ne!(a.engine_token, b.engine_token);
        assert_ne!(a.session_id, b.session_id);
    }

    #[test]
    fn delete_is_idempotent_and_clears_token() {
        let reg = registry(4);
        let session = reg.create(3, 4, None).unwrap();

        assert!(reg.delete(&session.session_id));
        assert!(reg.get(&session.session_id).is_none());
        assert_eq!(reg.verify(&session.engine_token), None);

        // Second delete on the same id: not found, no side effects
        assert!(!reg.delete(&session.session_id));
        assert!(!reg.delete("unknown-id"));
    }

    #[test]
    fn cap_is_enforced_and_freed_by_delete() {
        let reg = registry(2);
        let first = reg.create(1, 1, None).unwrap();
        reg.create(1, 2, None).unwrap();

        let err = reg.create(1, 3, None).unwrap_err();
        assert!(matches!(err, GatewayError::CapacityExhausted(2)));

        reg.delete(&first.session_id);
        assert!(reg.create(1, 3, None).is_ok());
    }

    #[test]
    fn sweep_evicts_idle_sessions() {
        let reg = SessionRegistry::new(4, Duration::from_millis(0));
        let session = reg.create(1, 1, None).unwrap();

        std::thread::sleep(Duration::from_millis(5));
        reg.sweep();

        assert!(reg.get(&session.session_id).is_none());
        assert_eq!(reg.verify(&session.engine_token), None);
        assert_eq!(reg.active_count(), 0);
    }

    #[test]
    fn sessions_go_idle_before_eviction() {
        let reg = SessionRegistry::new(4, Duration::from_millis(100));
        let session = reg.create(1, 1, None).unwrap();

        std::thread::sleep(Duration::from_millis(60));
        reg.sweep();
        let snapshot = reg.get(&session.session_id).unwrap();
        assert_eq!(snapshot.status, SessionStatus::Idle);

        std::thread::sleep(Duration::from_millis(60));
        reg.sweep();
        assert!(reg.get(&session.session_id).is_none());
    }

    #[test]
    fn touch_keeps_a_session_alive() {
        let reg = SessionRegistry::new(4, Duration::from_millis(50));
        let session = reg.create(1, 1, None).unwrap();

        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(20));
            reg.touch(&session.session_id);
        }
        reg.sweep();
        assert!(reg.get(&session.session_id).is_some());
    }
}
