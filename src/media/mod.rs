// Media transport: peer connections, negotiation, track ownership
//
// One media session per connection key (user:<uid> form preferred, so every
// session of a user shares the same peer). The gateway is always the
// answerer; both tracks are declared in send mode before the answer is
// generated so attaching real sources later needs no renegotiation.
// Connectivity is relay-only: see sdp.rs for the rewriting policy.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, RwLock};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::avatar::Frame;
use crate::config::WebRtcConfig;
use crate::error::GatewayError;

pub mod sdp;
pub mod tracks;

use sdp::{IceCandidate, RewrittenAnswer};
use tracks::AvSync;

/// Negotiation result handed back to the message router
#[derive(Debug)]
pub struct NegotiatedAnswer {
    pub sdp: String,
    pub candidates: Vec<IceCandidate>,
}

/// One peer connection with its two feeder queues and sync latch
pub struct MediaSession {
    pub key: String,
    pc: Arc<RTCPeerConnection>,
    pub sync: Arc<AvSync>,
    pub video_feed: mpsc::UnboundedSender<Frame>,
    pub audio_feed: mpsc::UnboundedSender<Vec<f32>>,
    shutdown: watch::Sender<bool>,
}

impl MediaSession {
    /// Push one 20 ms PCM chunk toward the audio track
    pub fn feed_audio_chunk(&self, samples: Vec<f32>) {
        let _ = self.audio_feed.send(samples);
    }

    /// Push one frame toward the video track
    pub fn feed_frame(&self, frame: Frame) {
        let _ = self.video_feed.send(frame);
    }
}

/// Owner of all media sessions, keyed by connection key
pub struct MediaTransport {
    api: API,
    config: WebRtcConfig,
    sessions: RwLock<HashMap<String, Arc<MediaSession>>>,
}

impl MediaTransport {
    pub fn new(config: WebRtcConfig) -> anyhow::Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        // Advertise the public address in place of whatever the host thinks
        // its addresses are, and keep allocations inside the relay range
        setting_engine.set_nat_1to1_ips(
            vec![config.public_ip.clone()],
            RTCIceCandidateType::Host,
        );
        let mut ephemeral = EphemeralUDP::default();
        ephemeral.set_ports(config.port_min, config.port_max)?;
        setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        Ok(Self {
            api,
            config,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![
                RTCIceServer {
                    urls: vec![self.config.stun_server.clone()],
                    ..Default::default()
                },
                RTCIceServer {
                    urls: vec![self.config.turn_server_local.clone()],
                    username: self.config.turn_username.clone(),
                    credential: self.config.turn_password.clone(),
                    ..Default::default()
                },
            ],
            ice_transport_policy: RTCIceTransportPolicy::Relay,
            ..Default::default()
        }
    }

    /// Look up an existing media session
    pub async fn session(&self, key: &str) -> Option<Arc<MediaSession>> {
        self.sessions.read().await.get(key).cloned()
    }

    /// Create the peer connection, tracks, and drivers for one key
    async fn create_session(
        self: &Arc<Self>,
        key: &str,
        idle_frames: Arc<Vec<Frame>>,
    ) -> Result<Arc<MediaSession>, GatewayError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_configuration())
                .await
                .map_err(|e| GatewayError::Upstream(format!("peer connection: {e}")))?,
        );

        // Both tracks are added before answer generation so the transceivers
        // are already in the SDP when the pipeline attaches real sources
        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                clock_rate: 90_000,
                ..Default::default()
            },
            "video".to_owned(),
            format!("avatar-video-{key}"),
        ));
        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            format!("avatar-audio-{key}"),
        ));

        pc.add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| GatewayError::Upstream(format!("add video track: {e}")))?;
        pc.add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| GatewayError::Upstream(format!("add audio track: {e}")))?;

        let sync = Arc::new(AvSync::new());
        let (video_feed_tx, video_feed_rx) = mpsc::unbounded_channel();
        let (audio_feed_tx, audio_feed_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(tracks::drive_video(
            video_track,
            video_feed_rx,
            idle_frames,
            Arc::clone(&sync),
            shutdown_rx.clone(),
        ));
        tokio::spawn(tracks::drive_audio(
            audio_track,
            audio_feed_rx,
            Arc::clone(&sync),
            shutdown_rx,
        ));

        // Tear the session down once the transport is beyond recovery
        let transport = Arc::downgrade(self);
        let state_key = key.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let transport = transport.clone();
            let state_key = state_key.clone();
            Box::pin(async move {
                tracing::info!(key = %state_key, ?state, "Peer connection state changed");
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                ) {
                    if let Some(transport) = transport.upgrade() {
                        transport.close_session(&state_key).await;
                    }
                }
            })
        }));

        let session = Arc::new(MediaSession {
            key: key.to_string(),
            pc,
            sync,
            video_feed: video_feed_tx,
            audio_feed: audio_feed_tx,
            shutdown: shutdown_tx,
        });

        self.sessions
            .write()
            .await
            .insert(key.to_string(), Arc::clone(&session));
        tracing::info!(key, "Media session created");
        Ok(session)
    }

    /// Answer a client offer, applying the relay-only policy to the result.
    ///
    /// Returns the rewritten answer SDP plus the relay candidates extracted
    /// from it for trickle delivery over the message channel.
    pub async fn handle_offer(
        self: &Arc<Self>,
        key: &str,
        offer_sdp: &str,
        idle_frames: Arc<Vec<Frame>>,
    ) -> Result<NegotiatedAnswer, GatewayError> {
        let session = match self.session(key).await {
            Some(session) => session,
            None => self.create_session(key, idle_frames).await?,
        };
        let pc = &session.pc;

        let offer = RTCSessionDescription::offer(offer_sdp.to_string())
            .map_err(|e| GatewayError::MalformedRequest(format!("bad offer sdp: {e}")))?;
        pc.set_remote_description(offer)
            .await
            .map_err(|e| GatewayError::Upstream(format!("set remote description: {e}")))?;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| GatewayError::Upstream(format!("create answer: {e}")))?;

        // Wait out gathering so the SDP carries the complete candidate set;
        // the relay filter then works on the full picture
        let mut gathered = pc.gathering_complete_promise().await;
        pc.set_local_description(answer)
            .await
            .map_err(|e| GatewayError::Upstream(format!("set local description: {e}")))?;
        let _ = gathered.recv().await;

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| GatewayError::Upstream("no local description".into()))?;

        let RewrittenAnswer { sdp, candidates } =
            sdp::rewrite_answer(&local.sdp, &self.config.public_ip);

        tracing::info!(
            key,
            candidates = candidates.len(),
            "WebRTC answer negotiated (relay-only)"
        );

        Ok(NegotiatedAnswer { sdp, candidates })
    }

    /// Feed a client ICE candidate into the session's agent
    pub async fn add_ice_candidate(
        &self,
        key: &str,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> Result<(), GatewayError> {
        let session = self
            .session(key)
            .await
            .ok_or_else(|| GatewayError::NotFound(format!("media session {key}")))?;

        session
            .pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate,
                sdp_mid,
                sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| GatewayError::MalformedRequest(format!("bad ice candidate: {e}")))?;
        Ok(())
    }

    /// Idempotent teardown of one session: drivers, tracks, peer handle
    pub async fn close_session(&self, key: &str) {
        let session = self.sessions.write().await.remove(key);
        if let Some(session) = session {
            let _ = session.shutdown.send(true);
            if let Err(e) = session.pc.close().await {
                tracing::warn!(key, "Error closing peer connection: {e}");
            }
            tracing::info!(key, "Media session closed");
        }
    }

    /// Number of live media sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
