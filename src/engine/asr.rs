//! ASR collaborator: remote Whisper service client and mock
//!
//! The gateway never runs the transcription model in-process; in real mode
//! utterances are shipped to a colocated serving endpoint.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::AsrConfig;
use crate::error::GatewayError;

/// Utterance transcription capability
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Transcribe an encoded utterance (WAV/MP3/OGG/WebM) to text
    async fn transcribe(&self, audio: &[u8], language: &str) -> Result<String, GatewayError>;
}

/// Client for a Whisper-family HTTP transcription service
pub struct WhisperService {
    client: reqwest::Client,
    url: String,
    model: String,
}

#[derive(Deserialize)]
struct TranscribeResponse {
    text: String,
}

impl WhisperService {
    pub fn new(client: reqwest::Client, config: &AsrConfig, url: String) -> Self {
        tracing::info!(
            model = %config.model,
            device = %config.device,
            url = %url,
            "ASR engine initialized"
        );
        Self {
            client,
            url,
            model: config.model.clone(),
        }
    }
}

#[async_trait]
impl SpeechRecognizer for WhisperService {
    async fn transcribe(&self, audio: &[u8], language: &str) -> Result<String, GatewayError> {
        use base64::Engine as _;

        let body = json!({
            "model": self.model,
            "language": language,
            "audio": base64::engine::general_purpose::STANDARD.encode(audio),
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream(format!("asr request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(GatewayError::Upstream(format!(
                "asr returned status {}",
                response.status()
            )));
        }

        let decoded: TranscribeResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Upstream(format!("asr response decode failed: {e}")))?;
        Ok(decoded.text)
    }
}

/// Deterministic transcription stand-in
pub struct MockRecognizer;

impl MockRecognizer {
    pub fn new() -> Self {
        tracing::info!("ASR engine initialized (mock mode)");
        Self
    }
}

#[async_trait]
impl SpeechRecognizer for MockRecognizer {
    async fn transcribe(&self, audio: &[u8], language: &str) -> Result<String, GatewayError> {
        Ok(format!(
            "[mock transcription, lang={}, {} bytes of audio]",
            language,
            audio.len()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_transcription_is_deterministic() {
        let asr = MockRecognizer::new();
        let a = asr.transcribe(&[0u8; 16], "zh").await.unwrap();
        let b = asr.transcribe(&[1u8; 16], "zh").await.unwrap();
        assert_eq!(a, b);
        assert!(a.contains("16 bytes"));
    }
}
