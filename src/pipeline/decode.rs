//! Compressed-audio decoding to the pipeline's PCM format
//!
//! Everything downstream of the TTS worker runs on 16 kHz mono f32 samples.
//! The real synthesizer returns MP3, decoded through an external ffmpeg
//! child; the mock returns WAV that is parsed in place. Decoding is
//! deterministic either way: the same blob yields the same samples.

use std::io::{Read, Write};
use std::process::{Command, Stdio};

use crate::error::GatewayError;
use crate::process::ScopedChild;

/// Pipeline PCM sample rate
pub const SAMPLE_RATE: u32 = 16_000;

/// Blob-to-PCM decoding capability (sync; runs on the TTS worker thread)
pub trait PcmDecoder: Send + Sync {
    fn decode(&self, blob: &[u8]) -> Result<Vec<f32>, GatewayError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// ffmpeg
// ─────────────────────────────────────────────────────────────────────────────

/// External decoder: any container/codec ffmpeg understands
pub struct FfmpegDecoder {
    ffmpeg_path: String,
}

impl FfmpegDecoder {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }
}

impl PcmDecoder for FfmpegDecoder {
    fn decode(&self, blob: &[u8]) -> Result<Vec<f32>, GatewayError> {
        let child = Command::new(&self.ffmpeg_path)
            .args([
                "-y", "-i", "-", "-ar", "16000", "-ac", "1", "-f", "s16le", "-",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| GatewayError::Upstream(format!("failed to spawn decoder: {e}")))?;
        let mut child = ScopedChild::new(child, "ffmpeg-decode");

        let mut stdin = child
            .inner_mut()
            .stdin
            .take()
            .ok_or_else(|| GatewayError::Upstream("decoder stdin unavailable".into()))?;
        let mut stdout = child
            .inner_mut()
            .stdout
            .take()
            .ok_or_else(|| GatewayError::Upstream("decoder stdout unavailable".into()))?;

        // Writer on a side thread so the stdout pipe cannot deadlock
        let input = blob.to_vec();
        let writer = std::thread::spawn(move || {
            let _ = stdin.write_all(&input);
            // stdin drops here, signalling EOF to the decoder
        });

        let mut raw = Vec::new();
        stdout
            .read_to_end(&mut raw)
            .map_err(|e| GatewayError::Upstream(format!("decoder read failed: {e}")))?;
        let _ = writer.join();

        let status = child
            .wait()
            .map_err(|e| GatewayError::Upstream(format!("decoder wait failed: {e}")))?;
        if !status.success() {
            return Err(GatewayError::Upstream(format!(
                "decoder exited with {status}"
            )));
        }

        Ok(pcm_s16le_to_f32(&raw))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// WAV passthrough
// ─────────────────────────────────────────────────────────────────────────────

/// In-process decoder for the mock synthesizer's 16 kHz mono WAV output
pub struct WavDecoder;

impl PcmDecoder for WavDecoder {
    fn decode(&self, blob: &[u8]) -> Result<Vec<f32>, GatewayError> {
        let data = wav_data_chunk(blob)?;
        Ok(pcm_s16le_to_f32(data))
    }
}

/// Locate the `data` chunk of a 16 kHz mono s16le RIFF/WAVE blob
fn wav_data_chunk(blob: &[u8]) -> Result<&[u8], GatewayError> {
    if blob.len() < 44 || &blob[..4] != b"RIFF" || &blob[8..12] != b"WAVE" {
        return Err(GatewayError::Upstream("not a RIFF/WAVE blob".into()));
    }

    let channels = u16::from_le_bytes([blob[22], blob[23]]);
    let rate = u32::from_le_bytes([blob[24], blob[25], blob[26], blob[27]]);
    let bits = u16::from_le_bytes([blob[34], blob[35]]);
    if channels != 1 || rate != SAMPLE_RATE || bits != 16 {
        return Err(GatewayError::Upstream(format!(
            "unsupported WAV layout: {channels}ch {rate}Hz {bits}bit"
        )));
    }

    // Walk chunks from byte 12 until the data chunk
    let mut pos = 12;
    while pos + 8 <= blob.len() {
        let id = &blob[pos..pos + 4];
        let len = u32::from_le_bytes([blob[pos + 4], blob[pos + 5], blob[pos + 6], blob[pos + 7]])
            as usize;
        let body = pos + 8;
        if id == b"data" {
            let end = (body + len).min(blob.len());
            return Ok(&blob[body..end]);
        }
        pos = body + len + (len & 1);
    }
    Err(GatewayError::Upstream("WAV data chunk missing".into()))
}

fn pcm_s16le_to_f32(raw: &[u8]) -> Vec<f32> {
    raw.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tts::encode_wav_mono16;

    #[test]
    fn wav_round_trips_through_the_decoder() {
        let samples: Vec<i16> = (0..640).map(|n| (n * 13 % 2000 - 1000) as i16).collect();
        let wav = encode_wav_mono16(&samples, SAMPLE_RATE);

        let decoded = WavDecoder.decode(&wav).unwrap();
        assert_eq!(decoded.len(), samples.len());
        for (orig, dec) in samples.iter().zip(&decoded) {
            assert!((*orig as f32 / 32768.0 - dec).abs() < 1e-6);
        }
    }

    #[test]
    fn wav_decoder_rejects_wrong_layout() {
        let stereoish = encode_wav_mono16(&[0i16; 64], 44_100);
        assert!(WavDecoder.decode(&stereoish).is_err());
        assert!(WavDecoder.decode(b"not audio at all").is_err());
    }
}
