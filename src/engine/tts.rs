//! TTS collaborator: remote synthesis client and deterministic mock
//!
//! `synthesize` returns a compressed audio blob (MP3 from the real service,
//! WAV from the mock); the lip-sync pipeline decodes whatever comes back to
//! 16 kHz mono PCM before chunking, so the container format is the
//! collaborator's choice.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde_json::json;

use crate::config::TtsConfig;
use crate::error::GatewayError;

/// Lazy sequence of compressed audio blobs for the realtime pipeline
pub type AudioBlobStream = Pin<Box<dyn Stream<Item = Result<Bytes, GatewayError>> + Send>>;

/// Speech synthesis capability
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize one string to a compressed audio blob
    async fn synthesize(&self, text: &str, language: &str) -> Result<Bytes, GatewayError>;

    /// Streaming variant; the default yields the one-shot result as a single
    /// blob, which is what the realtime worker consumes today
    async fn synthesize_stream(
        &self,
        text: &str,
        language: &str,
    ) -> Result<AudioBlobStream, GatewayError> {
        let blob = self.synthesize(text, language).await?;
        Ok(Box::pin(futures::stream::once(async move { Ok(blob) })))
    }
}

/// Client for an Edge-TTS-compatible HTTP synthesis service
pub struct EdgeTtsService {
    client: reqwest::Client,
    url: String,
    voice: String,
    rate: String,
    pitch: String,
}

impl EdgeTtsService {
    pub fn new(client: reqwest::Client, config: &TtsConfig, url: String) -> Self {
        tracing::info!(voice = %config.voice, rate = %config.rate, url = %url, "TTS engine initialized");
        Self {
            client,
            url,
            voice: config.voice.clone(),
            rate: config.rate.clone(),
            pitch: config.pitch.clone(),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for EdgeTtsService {
    async fn synthesize(&self, text: &str, language: &str) -> Result<Bytes, GatewayError> {
        let body = json!({
            "text": text,
            "voice": self.voice,
            "rate": self.rate,
            "pitch": self.pitch,
            "language": language,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream(format!("tts request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(GatewayError::Upstream(format!(
                "tts returned status {}",
                response.status()
            )));
        }

        response
            .bytes()
            .await
            .map_err(|e| GatewayError::Upstream(format!("tts body read failed: {e}")))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mock
// ─────────────────────────────────────────────────────────────────────────────

/// Sample rate of the mock's WAV output; matches the pipeline's PCM target so
/// decoding is a passthrough
pub const MOCK_SAMPLE_RATE: u32 = 16_000;

/// Deterministic synthesis stand-in: a 220 Hz tone, 200 ms per word
pub struct MockSynthesizer;

impl MockSynthesizer {
    pub fn new() -> Self {
        tracing::info!("TTS engine initialized (mock mode)");
        Self
    }

    fn tone_samples(word_count: usize) -> Vec<i16> {
        let samples_per_word = MOCK_SAMPLE_RATE as usize / 5; // 200 ms
        let total = samples_per_word * word_count.max(2);
        (0..total)
            .map(|n| {
                let t = n as f64 / MOCK_SAMPLE_RATE as f64;
                ((t * 220.0 * 2.0 * std::f64::consts::PI).sin() * 8000.0) as i16
            })
            .collect()
    }
}

#[async_trait]
impl SpeechSynthesizer for MockSynthesizer {
    async fn synthesize(&self, text: &str, _language: &str) -> Result<Bytes, GatewayError> {
        let words = text.split_whitespace().count();
        let samples = Self::tone_samples(words);
        Ok(Bytes::from(encode_wav_mono16(&samples, MOCK_SAMPLE_RATE)))
    }
}

/// Minimal RIFF/WAVE container around s16le mono PCM
pub fn encode_wav_mono16(samples: &[i16], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let byte_rate = sample_rate * 2;
    let mut out = Vec::with_capacity(44 + data_len as usize);

    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes()); // fmt chunk size
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes()); // block align
    out.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_output_is_wav_and_scales_with_text() {
        let tts = MockSynthesizer::new();
        let short = tts.synthesize("hi", "en").await.unwrap();
        let long = tts.synthesize("one two three four five six", "en").await.unwrap();

        assert_eq!(&short[..4], b"RIFF");
        assert_eq!(&short[8..12], b"WAVE");
        assert!(long.len() > short.len());
    }

    #[test]
    fn wav_header_declares_16k_mono() {
        let wav = encode_wav_mono16(&[0i16; 320], 16_000);
        let channels = u16::from_le_bytes([wav[22], wav[23]]);
        let rate = u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]);
        let data_len = u32::from_le_bytes([wav[40], wav[41], wav[42], wav[43]]);
        assert_eq!(channels, 1);
        assert_eq!(rate, 16_000);
        assert_eq!(data_len, 640);
    }
}
