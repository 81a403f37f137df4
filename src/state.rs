//! Shared gateway state handed to every surface
//!
//! All fields are `Arc`s: the HTTP handlers, the message channel, and the
//! background tasks each clone the state and share the same registries.

use std::sync::Arc;

use crate::avatar::AvatarManager;
use crate::config::Config;
use crate::engine::EngineCache;
use crate::gateway::Connections;
use crate::pipeline::decode::{FfmpegDecoder, PcmDecoder, WavDecoder};
use crate::pipeline::LipSyncEngines;
use crate::sessions::SessionRegistry;
use crate::media::MediaTransport;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Session registry: admission control and token verification
    pub registry: Arc<SessionRegistry>,
    /// Per-tutor engine cache
    pub engines: Arc<EngineCache>,
    /// Avatar assets and idle-frame banks
    pub avatars: Arc<AvatarManager>,
    /// Per-avatar streaming lip-sync engines
    pub lipsync: Arc<LipSyncEngines>,
    /// WebRTC media sessions
    pub transport: Arc<MediaTransport>,
    /// Live message-channel connections and session contexts
    pub connections: Arc<Connections>,
}

impl AppState {
    /// Decoder matching the active synthesizer's output format
    pub fn pcm_decoder(&self) -> Arc<dyn PcmDecoder> {
        if self.config.features.tts && self.config.tts.service_url.is_some() {
            Arc::new(FfmpegDecoder::new(self.config.avatar.ffmpeg_path.clone()))
        } else {
            Arc::new(WavDecoder)
        }
    }
}
