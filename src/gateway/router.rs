// Message router
//
// Interprets typed inbound messages and drives the matching pipeline. Every
// handler replies on the connection's outbound queue; replies for one
// message finish before the next message's replies begin, except the
// background video generation spawned by `text`, which may interleave a
// later `video` reply by design.

use std::sync::Arc;

use base64::Engine as _;
use tokio::sync::mpsc;

use crate::engine::Engine;
use crate::error::GatewayError;
use crate::gateway::messages::{Inbound, Outbound};
use crate::gateway::{media_key_for_user, ConnectionMode, SessionContext};
use crate::pipeline::{coupler, CHUNK_SAMPLES, PREBUFFER_FRAMES};
use crate::state::AppState;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Resolved execution context for one engine-backed message
struct Resolved {
    engine: Arc<Engine>,
    tutor_id: i64,
    kb_id: Option<String>,
}

/// Dispatch one inbound message
pub async fn handle_message(
    state: &AppState,
    outbound: &mpsc::UnboundedSender<Outbound>,
    mode: &ConnectionMode,
    default_session_id: Option<&str>,
    message: Inbound,
) {
    // Every inbound message refreshes its session's activity stamp
    if let Some(session_id) = message.engine_session_id.as_deref().or(default_session_id) {
        state.registry.touch(session_id);
    }

    tracing::info!(
        kind = %message.kind,
        session = default_session_id.unwrap_or("sessionless"),
        "Received message"
    );

    match message.kind.as_str() {
        "init" => handle_init(state, outbound, &message).await,
        "text" => handle_text(state, outbound, mode, default_session_id, &message).await,
        "text_webrtc" => {
            handle_text_webrtc(state, outbound, mode, default_session_id, &message).await
        }
        "audio" => handle_audio(state, outbound, mode, default_session_id, &message).await,
        "webrtc_offer" => handle_webrtc_offer(state, outbound, &message).await,
        "webrtc_ice_candidate" => handle_ice_candidate(state, outbound, &message).await,
        other => {
            let _ = outbound.send(Outbound::error(format!(
                "Unsupported message type: {other}"
            )));
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session / engine resolution
// ─────────────────────────────────────────────────────────────────────────────

/// Resolve the engine serving this message.
///
/// Order: an explicit `engine_session_id`, then the connection's default
/// session, then sessionless (message-level `tutor_id` mandatory). An error
/// reply has already been sent when this returns None.
async fn resolve(
    state: &AppState,
    outbound: &mpsc::UnboundedSender<Outbound>,
    _mode: &ConnectionMode,
    default_session_id: Option<&str>,
    message: &Inbound,
) -> Option<Resolved> {
    let target = message
        .engine_session_id
        .as_deref()
        .or(default_session_id);

    if let Some(session_id) = target {
        // Context cache first: repeated messages skip the registry
        if let Some(context) = state.connections.context(session_id) {
            return Some(Resolved {
                engine: context.engine,
                tutor_id: context.tutor_id,
                kb_id: message.kb_id.clone().or(context.kb_id),
            });
        }

        let Some(session) = state.registry.get(session_id) else {
            let _ = outbound.send(Outbound::error(format!(
                "Invalid engine_session_id: {session_id}"
            )));
            return None;
        };

        let engine = state.engines.acquire(session.tutor_id);
        state.connections.store_context(SessionContext {
            session_id: session.session_id.clone(),
            tutor_id: session.tutor_id,
            kb_id: session.kb_id.clone(),
            engine: Arc::clone(&engine),
        });

        return Some(Resolved {
            tutor_id: engine.tutor_id,
            engine,
            kb_id: message.kb_id.clone().or(session.kb_id),
        });
    }

    // Sessionless: the message must name its tutor
    let Some(tutor_id) = message.tutor_id else {
        let _ = outbound.send(Outbound::error("tutor_id is required in sessionless mode"));
        return None;
    };
    let engine = state.engines.acquire(tutor_id);
    Some(Resolved {
        tutor_id: engine.tutor_id,
        engine,
        kb_id: message.kb_id.clone(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// init
// ─────────────────────────────────────────────────────────────────────────────

/// Reply with exactly one idle-video clip
async fn handle_init(
    state: &AppState,
    outbound: &mpsc::UnboundedSender<Outbound>,
    message: &Inbound,
) {
    let Some(avatar_id) = message.avatar_id.clone() else {
        let _ = outbound.send(Outbound::error("avatar_id is required for init message"));
        return;
    };

    if !state.config.features.avatar {
        let _ = outbound.send(Outbound::error("Failed to get idle video"));
        return;
    }

    let avatars = Arc::clone(&state.avatars);
    let clip = tokio::task::spawn_blocking(move || avatars.render_idle_clip(&avatar_id)).await;

    match clip {
        Ok(Ok(clip)) => {
            let _ = outbound.send(Outbound::video("", B64.encode(&clip)));
        }
        Ok(Err(e)) => {
            tracing::error!("Idle clip failed: {e}");
            let _ = outbound.send(Outbound::error("Failed to get idle video"));
        }
        Err(e) => {
            tracing::error!("Idle clip task failed: {e}");
            let _ = outbound.send(Outbound::error("Failed to get idle video"));
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// text / audio
// ─────────────────────────────────────────────────────────────────────────────

async fn handle_text(
    state: &AppState,
    outbound: &mpsc::UnboundedSender<Outbound>,
    mode: &ConnectionMode,
    default_session_id: Option<&str>,
    message: &Inbound,
) {
    let Some(resolved) = resolve(state, outbound, mode, default_session_id, message).await else {
        return;
    };
    let content = message.content.clone().unwrap_or_default();
    run_text_turn(state, outbound, &resolved, &content, message).await;
}

/// ASR first, then the same path as `text` on the transcription
async fn handle_audio(
    state: &AppState,
    outbound: &mpsc::UnboundedSender<Outbound>,
    mode: &ConnectionMode,
    default_session_id: Option<&str>,
    message: &Inbound,
) {
    let Some(data) = message.data.as_deref() else {
        let _ = outbound.send(Outbound::error("data is required for audio message"));
        return;
    };
    let Ok(audio_bytes) = B64.decode(data) else {
        let _ = outbound.send(Outbound::error("audio data is not valid base64"));
        return;
    };

    let Some(resolved) = resolve(state, outbound, mode, default_session_id, message).await else {
        return;
    };

    let transcription = match resolved.engine.transcribe(&audio_bytes).await {
        Ok(transcription) => transcription,
        Err(e) => {
            tracing::error!("Transcription failed: {e}");
            let _ = outbound.send(Outbound::error(format!("Failed to process message: {e}")));
            return;
        }
    };
    let _ = outbound.send(Outbound::transcription(transcription.clone()));

    run_text_turn(state, outbound, &resolved, &transcription, message).await;
}

/// One LLM turn: reply text immediately, then audio (media track when a
/// user_id is present, inline otherwise), then optionally kick off
/// background video generation.
async fn run_text_turn(
    state: &AppState,
    outbound: &mpsc::UnboundedSender<Outbound>,
    resolved: &Resolved,
    text: &str,
    message: &Inbound,
) {
    let response = match resolved.engine.respond_text(text, resolved.kb_id.as_deref()).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(tutor_id = resolved.tutor_id, "LLM turn failed: {e}");
            let _ = outbound.send(Outbound::error(format!("Failed to process message: {e}")));
            return;
        }
    };

    let _ = outbound.send(Outbound::text(response.clone()));

    let audio_blob = match resolved.engine.synthesize(&response).await {
        Ok(blob) => blob,
        Err(e) => {
            tracing::error!("Speech synthesis failed: {e}");
            let _ = outbound.send(Outbound::error(format!("Failed to synthesize speech: {e}")));
            return;
        }
    };

    match message.user_id {
        Some(user_id) => {
            // Media-track delivery; the inline fallback is reserved for
            // clients that never negotiated a media session
            deliver_audio_via_media(state, user_id, &audio_blob).await;
        }
        None => {
            let _ = outbound.send(Outbound::audio(response.clone(), B64.encode(&audio_blob)));
        }
    }

    if state.config.features.avatar {
        if let Some(avatar_id) = message.avatar_id.clone() {
            spawn_background_video(state.clone(), outbound.clone(), avatar_id, response, resolved);
        }
    }
}

/// Decode the synthesized blob and feed it to the user's audio track
async fn deliver_audio_via_media(state: &AppState, user_id: i64, audio_blob: &[u8]) {
    let key = media_key_for_user(user_id);
    let Some(media) = state.transport.session(&key).await else {
        tracing::warn!(user_id, "No media session for audio delivery");
        return;
    };

    let decoder = state.pcm_decoder();
    let blob = audio_blob.to_vec();
    let pcm = tokio::task::spawn_blocking(move || decoder.decode(&blob)).await;

    match pcm {
        Ok(Ok(pcm)) => {
            for window in pcm.chunks(CHUNK_SAMPLES) {
                let mut samples = window.to_vec();
                samples.resize(CHUNK_SAMPLES, 0.0);
                media.feed_audio_chunk(samples);
            }
            // Audio alone is real content: start the paced timeline
            media.sync.latch();
            tracing::info!(key = %media.key, "Audio sent via media track");
        }
        Ok(Err(e)) => tracing::error!(user_id, "Audio decode for media delivery failed: {e}"),
        Err(e) => tracing::error!(user_id, "Audio decode task failed: {e}"),
    }
}

/// Generate a lip-synced clip for the reply in the background and deliver
/// it as a later `video` message. Failures are logged, never surfaced.
fn spawn_background_video(
    state: AppState,
    outbound: mpsc::UnboundedSender<Outbound>,
    avatar_id: String,
    response: String,
    resolved: &Resolved,
) {
    let synthesizer = resolved.engine.synthesizer();
    let supersedes = state.config.video_supersedes_inline_audio;

    tokio::spawn(async move {
        let avatars = Arc::clone(&state.avatars);
        let lipsync = Arc::clone(&state.lipsync);
        let engine_avatar = avatar_id.clone();
        let speech = response.clone();

        // Engine creation, frame collection, and encoding are all blocking
        let clip = tokio::task::spawn_blocking(move || {
            let engine = lipsync.get_or_create(&engine_avatar, synthesizer)?;
            let (frames, pcm) = coupler::collect_clip(&engine, &speech);
            if frames.is_empty() {
                return Err(GatewayError::Upstream("no frames generated".into()));
            }
            avatars.render_speech_clip(&frames, &pcm)
        })
        .await;

        match clip {
            Ok(Ok(clip)) => {
                let _ = outbound.send(Outbound::video_superseding(
                    response,
                    B64.encode(&clip),
                    supersedes,
                ));
                tracing::info!(avatar_id, "Background video sent");
            }
            Ok(Err(e)) => tracing::error!(avatar_id, "Background video generation failed: {e}"),
            Err(e) => tracing::error!(avatar_id, "Background video task failed: {e}"),
        }
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// text_webrtc
// ─────────────────────────────────────────────────────────────────────────────

/// Full realtime path: stream LLM tokens into the lip-sync pipeline sentence
/// by sentence while the coupler pushes frames through the media tracks;
/// the text reply goes inline once generation completes.
async fn handle_text_webrtc(
    state: &AppState,
    outbound: &mpsc::UnboundedSender<Outbound>,
    mode: &ConnectionMode,
    default_session_id: Option<&str>,
    message: &Inbound,
) {
    let Some(avatar_id) = message.avatar_id.clone() else {
        let _ = outbound.send(Outbound::error("avatar_id is required for WebRTC streaming"));
        return;
    };
    let Some(user_id) = message.user_id else {
        let _ = outbound.send(Outbound::error("user_id is required for WebRTC streaming"));
        return;
    };
    let Some(resolved) = resolve(state, outbound, mode, default_session_id, message).await else {
        return;
    };
    let content = message.content.clone().unwrap_or_default();

    // First use loads the avatar bundle from disk; keep that off the
    // connection's task
    let lipsync = Arc::clone(&state.lipsync);
    let synthesizer = resolved.engine.synthesizer();
    let engine_avatar = avatar_id.clone();
    let engine = tokio::task::spawn_blocking(move || {
        lipsync.get_or_create(&engine_avatar, synthesizer)
    })
    .await;
    let engine = match engine {
        Ok(Ok(engine)) => engine,
        Ok(Err(e)) => {
            tracing::error!(avatar_id, "Lip-sync engine unavailable: {e}");
            let _ = outbound.send(Outbound::error(format!("Failed to process message: {e}")));
            return;
        }
        Err(e) => {
            tracing::error!(avatar_id, "Lip-sync engine task failed: {e}");
            let _ = outbound.send(Outbound::error("Failed to process message"));
            return;
        }
    };

    // Drain residue from any previous request on this engine before the
    // coupler attaches
    engine.flush();

    // Frames can only flow if the client negotiated a media session first
    let media = state.transport.session(&media_key_for_user(user_id)).await;
    if media.is_none() {
        tracing::warn!(user_id, "No media session; streaming text only");
    }
    let pump = media.map(|media| {
        tokio::spawn(coupler::pump_to_media(
            Arc::clone(&engine),
            media,
            PREBUFFER_FRAMES,
        ))
    });

    let mut tokens = match resolved
        .engine
        .stream_response(&content, resolved.kb_id.as_deref())
        .await
    {
        Ok(tokens) => tokens,
        Err(e) => {
            tracing::error!("LLM stream failed: {e}");
            let _ = outbound.send(Outbound::error(format!("Failed to process message: {e}")));
            return;
        }
    };

    use futures::StreamExt;
    let mut full_response = String::new();
    let mut sentence_buffer = String::new();
    while let Some(token) = tokens.next().await {
        match token {
            Ok(token) => {
                full_response.push_str(&token);
                sentence_buffer.push_str(&token);
                let (complete, rest) = split_sentences(&sentence_buffer);
                for sentence in complete {
                    engine.speak(&sentence);
                }
                sentence_buffer = rest;
            }
            Err(e) => {
                tracing::error!("LLM stream error mid-generation: {e}");
                break;
            }
        }
    }
    if !sentence_buffer.trim().is_empty() {
        engine.speak(sentence_buffer.trim());
    }

    let _ = outbound.send(Outbound::text(full_response));

    if let Some(pump) = pump {
        match pump.await {
            Ok(frames) => tracing::info!(user_id, frames, "Realtime streaming finished"),
            Err(e) => tracing::error!(user_id, "Coupler task failed: {e}"),
        }
    }
}

/// Split accumulated text at sentence terminators, keeping each terminator
/// attached to its sentence; the tail without a terminator stays buffered.
fn split_sentences(buffer: &str) -> (Vec<String>, String) {
    const TERMINATORS: [char; 6] = ['。', '！', '？', '.', '!', '?'];

    let mut complete = Vec::new();
    let mut current = String::new();
    for c in buffer.chars() {
        current.push(c);
        if TERMINATORS.contains(&c) {
            let sentence = current.trim().to_string();
            if !sentence.is_empty() {
                complete.push(sentence);
            }
            current = String::new();
        }
    }
    (complete, current)
}

// ─────────────────────────────────────────────────────────────────────────────
// Signaling
// ─────────────────────────────────────────────────────────────────────────────

async fn handle_webrtc_offer(
    state: &AppState,
    outbound: &mpsc::UnboundedSender<Outbound>,
    message: &Inbound,
) {
    let Some(sdp) = message.sdp.clone() else {
        let _ = outbound.send(Outbound::error("SDP offer is required"));
        return;
    };
    let Some(user_id) = message.user_id else {
        let _ = outbound.send(Outbound::error("user_id is required for WebRTC"));
        return;
    };
    let Some(avatar_id) = message.avatar_id.clone() else {
        let _ = outbound.send(Outbound::error("avatar_id is required for WebRTC"));
        return;
    };

    // Best-effort idle bank: negotiation proceeds with an empty bank and the
    // track falls back to black frames
    let avatars = Arc::clone(&state.avatars);
    let bank_avatar = avatar_id.clone();
    let idle_frames = tokio::task::spawn_blocking(move || avatars.idle_frames(&bank_avatar))
        .await
        .ok()
        .and_then(|result| match result {
            Ok(bank) => Some(bank),
            Err(e) => {
                tracing::warn!(avatar_id, "Idle frames unavailable for media session: {e}");
                None
            }
        })
        .unwrap_or_else(|| Arc::new(Vec::new()));

    let key = media_key_for_user(user_id);
    match state.transport.handle_offer(&key, &sdp, idle_frames).await {
        Ok(answer) => {
            let _ = outbound.send(Outbound::webrtc_answer(answer.sdp));
            for candidate in answer.candidates {
                match serde_json::to_value(&candidate) {
                    Ok(value) => {
                        let _ = outbound.send(Outbound::ice_candidate(value));
                    }
                    Err(e) => tracing::error!("Candidate serialization failed: {e}"),
                }
            }
            let _ = outbound.send(Outbound::ice_candidates_done());
            tracing::info!(user_id, "WebRTC answer sent");
        }
        Err(e) => {
            tracing::error!(user_id, "Offer handling failed: {e}");
            let _ = outbound.send(Outbound::error(format!("Failed to process message: {e}")));
        }
    }
}

async fn handle_ice_candidate(
    state: &AppState,
    outbound: &mpsc::UnboundedSender<Outbound>,
    message: &Inbound,
) {
    let Some(candidate) = message.candidate.clone() else {
        let _ = outbound.send(Outbound::error("ICE candidate is required"));
        return;
    };
    let Some(user_id) = message.user_id else {
        let _ = outbound.send(Outbound::error("user_id is required for WebRTC"));
        return;
    };

    let (candidate, sdp_mid, sdp_mline_index) = candidate.into_parts();
    let key = media_key_for_user(user_id);
    if let Err(e) = state
        .transport
        .add_ice_candidate(&key, candidate, sdp_mid, sdp_mline_index)
        .await
    {
        tracing::error!(user_id, "ICE candidate rejected: {e}");
        let _ = outbound.send(Outbound::error(format!("Failed to process message: {e}")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avatar::AvatarManager;
    use crate::config::{Config, Features};
    use crate::engine::EngineCache;
    use crate::gateway::Connections;
    use crate::pipeline::LipSyncEngines;
    use crate::sessions::SessionRegistry;
    use crate::media::MediaTransport;
    use std::time::Duration;

    fn test_state() -> AppState {
        let config = Arc::new(Config {
            features: Features {
                llm: false,
                asr: false,
                tts: false,
                rag: false,
                avatar: false,
            },
            ..Config::default()
        });
        let avatars = Arc::new(AvatarManager::new(&config.avatar));
        AppState {
            registry: Arc::new(SessionRegistry::new(
                config.session.max_sessions,
                Duration::from_secs(config.session.timeout_seconds),
            )),
            engines: Arc::new(EngineCache::new(
                Arc::clone(&config),
                reqwest::Client::new(),
                Arc::clone(&avatars),
            )),
            lipsync: Arc::new(LipSyncEngines::new(Arc::clone(&config), Arc::clone(&avatars))),
            transport: Arc::new(
                MediaTransport::new(config.webrtc.clone()).expect("media transport"),
            ),
            connections: Arc::new(Connections::new()),
            avatars,
            config,
        }
    }

    fn user_mode() -> ConnectionMode {
        ConnectionMode::UserScoped {
            user_id: "42".into(),
        }
    }

    async fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn sessionless_text_without_tutor_id_is_an_error() {
        let state = test_state();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let message: Inbound =
            serde_json::from_str(r#"{"type":"text","content":"hi"}"#).unwrap();
        handle_message(&state, &tx, &user_mode(), None, message).await;

        let replies = drain(&mut rx).await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].kind, "error");
        assert_eq!(
            replies[0].content.as_deref(),
            Some("tutor_id is required in sessionless mode")
        );
    }

    #[tokio::test]
    async fn sessionless_text_with_tutor_id_round_trips() {
        let state = test_state();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let message: Inbound =
            serde_json::from_str(r#"{"type":"text","content":"hi","tutor_id":9}"#).unwrap();
        handle_message(&state, &tx, &user_mode(), None, message).await;

        let replies = drain(&mut rx).await;
        // Text reply, then inline audio (no user_id, no media channel)
        assert_eq!(replies[0].kind, "text");
        assert_eq!(replies[0].role.as_deref(), Some("assistant"));
        assert!(replies[0].content.as_deref().unwrap().contains("tutor 9"));
        assert_eq!(replies[1].kind, "audio");
        assert!(replies[1].audio.is_some());
    }

    #[tokio::test]
    async fn audio_message_replies_transcription_then_text() {
        let state = test_state();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let data = B64.encode(b"fake utterance bytes");
        let message: Inbound = serde_json::from_str(&format!(
            r#"{{"type":"audio","data":"{data}","tutor_id":3}}"#
        ))
        .unwrap();
        handle_message(&state, &tx, &user_mode(), None, message).await;

        let replies = drain(&mut rx).await;
        assert_eq!(replies[0].kind, "transcription");
        assert_eq!(replies[0].role.as_deref(), Some("user"));
        assert_eq!(replies[1].kind, "text");
        assert_eq!(replies[2].kind, "audio");
    }

    #[tokio::test]
    async fn unknown_message_type_is_reported() {
        let state = test_state();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let message: Inbound = serde_json::from_str(r#"{"type":"dance"}"#).unwrap();
        handle_message(&state, &tx, &user_mode(), None, message).await;

        let replies = drain(&mut rx).await;
        assert_eq!(replies[0].kind, "error");
        assert!(replies[0]
            .content
            .as_deref()
            .unwrap()
            .contains("Unsupported message type: dance"));
    }

    #[tokio::test]
    async fn invalid_engine_session_id_is_rejected() {
        let state = test_state();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let message: Inbound = serde_json::from_str(
            r#"{"type":"text","content":"hi","engine_session_id":"ghost"}"#,
        )
        .unwrap();
        handle_message(&state, &tx, &user_mode(), None, message).await;

        let replies = drain(&mut rx).await;
        assert_eq!(replies[0].kind, "error");
        assert!(replies[0]
            .content
            .as_deref()
            .unwrap()
            .contains("Invalid engine_session_id"));
    }

    #[tokio::test]
    async fn default_session_context_is_used_when_present() {
        let state = test_state();
        let session = state.registry.create(7, 1, None).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let message: Inbound =
            serde_json::from_str(r#"{"type":"text","content":"hello"}"#).unwrap();
        handle_message(
            &state,
            &tx,
            &user_mode(),
            Some(session.session_id.as_str()),
            message,
        )
        .await;

        let replies = drain(&mut rx).await;
        assert_eq!(replies[0].kind, "text");
        assert!(replies[0].content.as_deref().unwrap().contains("tutor 7"));
        // The context was cached for subsequent messages
        assert!(state.connections.context(&session.session_id).is_some());
    }

    #[tokio::test]
    async fn webrtc_offer_requires_fields() {
        let state = test_state();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let message: Inbound =
            serde_json::from_str(r#"{"type":"webrtc_offer","user_id":7}"#).unwrap();
        handle_message(&state, &tx, &user_mode(), None, message).await;
        let replies = drain(&mut rx).await;
        assert_eq!(replies[0].kind, "error");
        assert_eq!(replies[0].content.as_deref(), Some("SDP offer is required"));
    }

    #[tokio::test]
    async fn init_requires_avatar_id() {
        let state = test_state();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let message: Inbound = serde_json::from_str(r#"{"type":"init"}"#).unwrap();
        handle_message(&state, &tx, &user_mode(), None, message).await;
        let replies = drain(&mut rx).await;
        assert_eq!(replies[0].kind, "error");
        assert_eq!(
            replies[0].content.as_deref(),
            Some("avatar_id is required for init message")
        );
    }

    #[test]
    fn sentence_splitting_keeps_terminators() {
        let (complete, rest) = split_sentences("One. Two! Three");
        assert_eq!(complete, vec!["One.".to_string(), "Two!".to_string()]);
        assert_eq!(rest, " Three");

        let (complete, rest) = split_sentences("你好。世界");
        assert_eq!(complete, vec!["你好。".to_string()]);
        assert_eq!(rest, "世界");

        let (complete, rest) = split_sentences("no terminator yet");
        assert!(complete.is_empty());
        assert_eq!(rest, "no terminator yet");
    }
}
