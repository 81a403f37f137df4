// Configuration for the inference-engine gateway
//
// Configuration is loaded in order of precedence:
// 1. Environment variables (highest priority)
// 2. Built-in defaults (lowest priority)
//
// The variable names match the deployment environment of the upstream web
// backend, so the gateway can be dropped into the same container config.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Feature gates for the AI collaborators (opt-out: default enabled except RAG)
///
/// When a gate is off, a deterministic mock is substituted so the rest of the
/// gateway keeps working without the corresponding upstream service.
#[derive(Debug, Clone)]
pub struct Features {
    /// LLM text generation
    pub llm: bool,
    /// ASR utterance transcription
    pub asr: bool,
    /// TTS speech synthesis
    pub tts: bool,
    /// RAG knowledge-base retrieval
    pub rag: bool,
    /// Avatar / lip-sync video generation
    pub avatar: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            llm: true,
            asr: true,
            tts: true,
            rag: false,
            avatar: true,
        }
    }
}

/// Session admission settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Global cap on concurrently active sessions
    pub max_sessions: usize,
    /// Idle eviction threshold in seconds
    pub timeout_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            timeout_seconds: 3600,
        }
    }
}

/// LLM collaborator settings
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Base URL of the Ollama-compatible chat endpoint
    pub base_url: String,
    /// Model used when no per-tutor override exists
    pub default_model: String,
    /// Sampling temperature
    pub temperature: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_string(),
            default_model: "mistral-nemo:12b-instruct-2407-fp16".to_string(),
            temperature: 0.4,
        }
    }
}

impl LlmConfig {
    /// Resolve the model for a tutor, honoring the per-tutor override key.
    ///
    /// Different tutors may be configured with different weights via
    /// `TUTOR_{id}_LLM_MODEL`; this is the reason engines are cached per
    /// tutor rather than shared.
    pub fn model_for_tutor(&self, tutor_id: i64) -> String {
        std::env::var(format!("TUTOR_{tutor_id}_LLM_MODEL"))
            .unwrap_or_else(|_| self.default_model.clone())
    }
}

/// ASR collaborator settings
#[derive(Debug, Clone)]
pub struct AsrConfig {
    /// Whisper model size: tiny, base, small, medium, large
    pub model: String,
    /// Inference device: cuda or cpu
    pub device: String,
    /// Default transcription language
    pub language: String,
    /// Remote transcription service URL (real mode)
    pub service_url: Option<String>,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            model: "base".to_string(),
            device: "cuda".to_string(),
            language: "zh".to_string(),
            service_url: None,
        }
    }
}

/// TTS collaborator settings
#[derive(Debug, Clone)]
pub struct TtsConfig {
    /// Voice name, e.g. zh-CN-XiaoxiaoNeural
    pub voice: String,
    /// Speaking-rate adjustment, e.g. "+20%"
    pub rate: String,
    /// Pitch adjustment, e.g. "+10Hz"
    pub pitch: String,
    /// Remote synthesis service URL (real mode)
    pub service_url: Option<String>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            voice: "zh-CN-XiaoxiaoNeural".to_string(),
            rate: "+0%".to_string(),
            pitch: "+0Hz".to_string(),
            service_url: None,
        }
    }
}

/// RAG collaborator settings
#[derive(Debug, Clone)]
pub struct RagConfig {
    /// Retrieval service URL (real mode)
    pub url: Option<String>,
    /// Number of chunks returned per query
    pub top_k: usize,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self { url: None, top_k: 5 }
    }
}

/// Avatar asset and external-process locations
#[derive(Debug, Clone)]
pub struct AvatarConfig {
    /// Directory holding one subdirectory per avatar id
    pub avatars_dir: PathBuf,
    /// Lip-sync model installation root
    pub musetalk_base: PathBuf,
    /// Conda environment used by the model loader, if any
    pub musetalk_conda_env: Option<String>,
    /// Audio decoder binary
    pub ffmpeg_path: String,
    /// Inference batch size (frames per neural step)
    pub batch_size: usize,
}

impl Default for AvatarConfig {
    fn default() -> Self {
        Self {
            avatars_dir: PathBuf::from("/workspace/gpuserver/data/avatars"),
            musetalk_base: PathBuf::from("/workspace/MuseTalk"),
            musetalk_conda_env: None,
            ffmpeg_path: "ffmpeg".to_string(),
            batch_size: 8,
        }
    }
}

/// WebRTC transport advertisement and connectivity settings
///
/// Only the relay port range is externally reachable, so the answer SDP and
/// trickled candidates are restricted to relay-typed candidates carrying the
/// public address (see `media::sdp`).
#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    /// Address advertised to clients in place of any internal address
    pub public_ip: String,
    /// Relay/ephemeral UDP port range start
    pub port_min: u16,
    /// Relay/ephemeral UDP port range end
    pub port_max: u16,
    /// STUN server URL
    pub stun_server: String,
    /// TURN server URL as advertised to clients
    pub turn_server: String,
    /// TURN server URL for the gateway's own allocation (colocated relay)
    pub turn_server_local: String,
    /// TURN credentials
    pub turn_username: String,
    pub turn_password: String,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            public_ip: "127.0.0.1".to_string(),
            port_min: 10110,
            port_max: 10115,
            stun_server: "stun:stun.l.google.com:19302".to_string(),
            turn_server: "turn:127.0.0.1:10110".to_string(),
            turn_server_local: "turn:127.0.0.1:10110".to_string(),
            turn_username: "vtuser".to_string(),
            turn_password: "vtpass".to_string(),
        }
    }
}

/// Top-level gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Socket the unified HTTP + WebSocket server binds to
    pub bind_addr: SocketAddr,
    /// Externally visible ws:// base used when minting engine URLs
    pub websocket_url: String,
    /// Log level when RUST_LOG is unset
    pub log_level: String,
    pub features: Features,
    pub session: SessionConfig,
    pub llm: LlmConfig,
    pub asr: AsrConfig,
    pub tts: TtsConfig,
    pub rag: RagConfig,
    pub avatar: AvatarConfig,
    pub webrtc: WebRtcConfig,
    /// When true, a background `video` reply is marked as superseding the
    /// inline audio already delivered for the same utterance. The client
    /// decides what to do with the duplicate audio track; the gateway only
    /// carries the flag.
    pub video_supersedes_inline_audio: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".parse().expect("static bind addr"),
            websocket_url: "ws://localhost:9000".to_string(),
            log_level: "info".to_string(),
            features: Features::default(),
            session: SessionConfig::default(),
            llm: LlmConfig::default(),
            asr: AsrConfig::default(),
            tts: TtsConfig::default(),
            rag: RagConfig::default(),
            avatar: AvatarConfig::default(),
            webrtc: WebRtcConfig::default(),
            video_supersedes_inline_audio: false,
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_string(key) {
        Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

impl Config {
    /// Load configuration from environment variables with built-in defaults
    pub fn from_env() -> Self {
        let defaults = Config::default();

        let features = Features {
            llm: env_bool("ENABLE_LLM", defaults.features.llm),
            asr: env_bool("ENABLE_ASR", defaults.features.asr),
            tts: env_bool("ENABLE_TTS", defaults.features.tts),
            rag: env_bool("ENABLE_RAG", defaults.features.rag),
            avatar: env_bool("ENABLE_AVATAR", defaults.features.avatar),
        };

        let session = SessionConfig {
            max_sessions: env_parse("MAX_SESSIONS").unwrap_or(defaults.session.max_sessions),
            timeout_seconds: env_parse("SESSION_TIMEOUT_SECONDS")
                .unwrap_or(defaults.session.timeout_seconds),
        };

        let llm = LlmConfig {
            base_url: env_string("OLLAMA_BASE_URL").unwrap_or(defaults.llm.base_url),
            default_model: env_string("DEFAULT_LLM_MODEL").unwrap_or(defaults.llm.default_model),
            temperature: env_parse("LLM_TEMPERATURE").unwrap_or(defaults.llm.temperature),
        };

        let asr = AsrConfig {
            model: env_string("ASR_MODEL").unwrap_or(defaults.asr.model),
            device: env_string("ASR_DEVICE").unwrap_or(defaults.asr.device),
            language: env_string("ASR_LANGUAGE").unwrap_or(defaults.asr.language),
            service_url: env_string("ASR_SERVICE_URL"),
        };

        let tts = TtsConfig {
            voice: env_string("TTS_VOICE").unwrap_or(defaults.tts.voice),
            rate: env_string("TTS_RATE").unwrap_or(defaults.tts.rate),
            pitch: env_string("TTS_PITCH").unwrap_or(defaults.tts.pitch),
            service_url: env_string("TTS_SERVICE_URL"),
        };

        let rag = RagConfig {
            url: env_string("RAG_URL"),
            top_k: env_parse("RAG_TOP_K").unwrap_or(defaults.rag.top_k),
        };

        let avatar = AvatarConfig {
            avatars_dir: env_string("AVATARS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.avatar.avatars_dir),
            musetalk_base: env_string("MUSETALK_BASE")
                .map(PathBuf::from)
                .unwrap_or(defaults.avatar.musetalk_base),
            musetalk_conda_env: env_string("MUSETALK_CONDA_ENV"),
            ffmpeg_path: env_string("FFMPEG_PATH").unwrap_or(defaults.avatar.ffmpeg_path),
            batch_size: env_parse("AVATAR_BATCH_SIZE").unwrap_or(defaults.avatar.batch_size),
        };

        let webrtc = WebRtcConfig {
            public_ip: env_string("WEBRTC_PUBLIC_IP").unwrap_or(defaults.webrtc.public_ip),
            port_min: env_parse("WEBRTC_PORT_MIN").unwrap_or(defaults.webrtc.port_min),
            port_max: env_parse("WEBRTC_PORT_MAX").unwrap_or(defaults.webrtc.port_max),
            stun_server: env_string("WEBRTC_STUN_SERVER").unwrap_or(defaults.webrtc.stun_server),
            turn_server: env_string("WEBRTC_TURN_SERVER").unwrap_or(defaults.webrtc.turn_server),
            turn_server_local: env_string("WEBRTC_TURN_SERVER_LOCAL")
                .unwrap_or(defaults.webrtc.turn_server_local),
            turn_username: env_string("WEBRTC_TURN_USERNAME")
                .unwrap_or(defaults.webrtc.turn_username),
            turn_password: env_string("WEBRTC_TURN_PASSWORD")
                .unwrap_or(defaults.webrtc.turn_password),
        };

        Config {
            bind_addr: env_parse("GATEWAY_BIND").unwrap_or(defaults.bind_addr),
            websocket_url: env_string("WEBSOCKET_URL").unwrap_or(defaults.websocket_url),
            log_level: env_string("GATEWAY_LOG_LEVEL").unwrap_or(defaults.log_level),
            features,
            session,
            llm,
            asr,
            tts,
            rag,
            avatar,
            webrtc,
            video_supersedes_inline_audio: env_bool(
                "VIDEO_SUPERSEDES_INLINE_AUDIO",
                defaults.video_supersedes_inline_audio,
            ),
        }
    }

    /// Media-channel URL handed out by the admission API.
    ///
    /// The WebSocket surface is mounted under /ws with its own /ws/{id}
    /// route, so the full unified-mode path is /ws/ws/{session_id}.
    pub fn engine_url(&self, session_id: &str) -> String {
        format!(
            "{}/ws/ws/{}",
            self.websocket_url.trim_end_matches('/'),
            session_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.session.max_sessions, 10);
        assert_eq!(config.session.timeout_seconds, 3600);
        assert!(config.features.llm);
        assert!(!config.features.rag);
        assert_eq!(config.avatar.batch_size, 8);
        assert!(config.webrtc.port_min < config.webrtc.port_max);
    }

    #[test]
    fn engine_url_is_unified_mode_shaped() {
        let config = Config {
            websocket_url: "ws://gpu.example.com:9000".to_string(),
            ..Config::default()
        };
        assert_eq!(
            config.engine_url("abc-123"),
            "ws://gpu.example.com:9000/ws/ws/abc-123"
        );
        // Trailing slash on the base does not double up
        let config = Config {
            websocket_url: "ws://gpu.example.com:9000/".to_string(),
            ..Config::default()
        };
        assert_eq!(
            config.engine_url("abc-123"),
            "ws://gpu.example.com:9000/ws/ws/abc-123"
        );
    }

    #[test]
    fn model_for_tutor_falls_back_to_default() {
        let llm = LlmConfig::default();
        // No override set for this tutor id
        assert_eq!(llm.model_for_tutor(999_001), llm.default_model);
    }
}
