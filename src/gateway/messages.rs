//! Message-channel envelopes
//!
//! Inbound messages are one JSON object with a mandatory `type` field; the
//! remaining fields are per-type and validated by the router so a missing
//! field yields a precise error reply instead of a decode failure. Outbound
//! messages share one envelope with optional payload fields and an ISO-8601
//! timestamp.

use serde::{Deserialize, Serialize};

/// Inbound client message, loosely decoded
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inbound {
    #[serde(rename = "type")]
    pub kind: String,
    /// User text for text / text_webrtc
    pub content: Option<String>,
    /// Tutor selector; mandatory only in sessionless mode
    pub tutor_id: Option<i64>,
    /// Session routing on user-scoped connections
    pub engine_session_id: Option<String>,
    /// Media-session key for WebRTC-related messages
    pub user_id: Option<i64>,
    pub avatar_id: Option<String>,
    pub kb_id: Option<String>,
    /// Base64-encoded utterance for audio messages
    pub data: Option<String>,
    /// Offer SDP
    pub sdp: Option<String>,
    /// Trickled ICE candidate
    pub candidate: Option<CandidateInit>,
}

/// Browser-shaped ICE candidate
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CandidateInit {
    /// Full RTCIceCandidateInit dictionary
    Dict {
        candidate: String,
        #[serde(rename = "sdpMid", default)]
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex", default)]
        sdp_mline_index: Option<u16>,
    },
    /// Bare candidate string
    Line(String),
}

impl CandidateInit {
    pub fn into_parts(self) -> (String, Option<String>, Option<u16>) {
        match self {
            CandidateInit::Dict {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => (candidate, sdp_mid, sdp_mline_index),
            CandidateInit::Line(candidate) => (candidate, None, None),
        }
    }
}

/// Outbound server message
#[derive(Debug, Clone, Serialize)]
pub struct Outbound {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<serde_json::Value>,
    /// Policy flag on background video replies: whether the client should
    /// discard the inline audio already delivered for this utterance
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supersedes_audio: Option<bool>,
    pub timestamp: String,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl Outbound {
    fn base(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            role: None,
            content: None,
            audio: None,
            video: None,
            sdp: None,
            candidate: None,
            supersedes_audio: None,
            timestamp: now(),
        }
    }

    /// Assistant text reply
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            role: Some("assistant".into()),
            content: Some(content.into()),
            ..Self::base("text")
        }
    }

    /// Interim ASR result, attributed to the user
    pub fn transcription(content: impl Into<String>) -> Self {
        Self {
            role: Some("user".into()),
            content: Some(content.into()),
            ..Self::base("transcription")
        }
    }

    /// Inline audio fallback (no media channel)
    pub fn audio(content: impl Into<String>, audio_b64: String) -> Self {
        Self {
            role: Some("assistant".into()),
            content: Some(content.into()),
            audio: Some(audio_b64),
            ..Self::base("audio")
        }
    }

    /// Inline video clip
    pub fn video(content: impl Into<String>, video_b64: String) -> Self {
        Self {
            role: Some("assistant".into()),
            content: Some(content.into()),
            video: Some(video_b64),
            ..Self::base("video")
        }
    }

    /// Background-generated video with the inline-audio policy flag
    pub fn video_superseding(
        content: impl Into<String>,
        video_b64: String,
        supersedes_audio: bool,
    ) -> Self {
        Self {
            supersedes_audio: Some(supersedes_audio),
            ..Self::video(content, video_b64)
        }
    }

    pub fn webrtc_answer(sdp: String) -> Self {
        Self {
            sdp: Some(sdp),
            ..Self::base("webrtc_answer")
        }
    }

    pub fn ice_candidate(candidate: serde_json::Value) -> Self {
        Self {
            candidate: Some(candidate),
            ..Self::base("webrtc_ice_candidate")
        }
    }

    /// Explicit end-of-candidates sentinel so clients stop gathering
    pub fn ice_candidates_done() -> Self {
        Self::base("webrtc_ice_candidates_done")
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::base("error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_parses_a_text_message() {
        let msg: Inbound = serde_json::from_str(
            r#"{"type":"text","content":"hi","tutor_id":9,"kb_id":"kb-1"}"#,
        )
        .unwrap();
        assert_eq!(msg.kind, "text");
        assert_eq!(msg.content.as_deref(), Some("hi"));
        assert_eq!(msg.tutor_id, Some(9));
        assert_eq!(msg.kb_id.as_deref(), Some("kb-1"));
    }

    #[test]
    fn inbound_candidate_accepts_both_shapes() {
        let dict: Inbound = serde_json::from_str(
            r#"{"type":"webrtc_ice_candidate","user_id":7,
                "candidate":{"candidate":"candidate:1 1 udp 1 1.2.3.4 9 typ relay",
                             "sdpMid":"0","sdpMLineIndex":0}}"#,
        )
        .unwrap();
        let (line, mid, index) = dict.candidate.unwrap().into_parts();
        assert!(line.starts_with("candidate:"));
        assert_eq!(mid.as_deref(), Some("0"));
        assert_eq!(index, Some(0));

        let bare: Inbound = serde_json::from_str(
            r#"{"type":"webrtc_ice_candidate","user_id":7,"candidate":"candidate:1 1 udp 1 1.2.3.4 9 typ relay"}"#,
        )
        .unwrap();
        let (line, mid, index) = bare.candidate.unwrap().into_parts();
        assert!(line.starts_with("candidate:"));
        assert!(mid.is_none());
        assert!(index.is_none());
    }

    #[test]
    fn outbound_omits_absent_fields() {
        let json = serde_json::to_value(Outbound::text("hello")).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["content"], "hello");
        assert!(json.get("audio").is_none());
        assert!(json.get("sdp").is_none());
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn error_reply_shape() {
        let json = serde_json::to_value(Outbound::error("boom")).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["content"], "boom");
        assert!(json.get("role").is_none());
    }

    #[test]
    fn background_video_carries_the_policy_flag() {
        let json =
            serde_json::to_value(Outbound::video_superseding("reply", "AAAA".into(), true)).unwrap();
        assert_eq!(json["type"], "video");
        assert_eq!(json["supersedes_audio"], true);
    }
}
