//! Neural lip-sync collaborator interfaces
//!
//! The denoising U-Net, VAE decoder, and Whisper-family feature extractor
//! are external models; the gateway talks to them through these capability
//! traits. The mock variants are deterministic and carry no weights, which
//! is what the `enable_avatar` gate substitutes and what the tests drive.

use std::path::Path;

use crate::avatar::{BoundingBox, Frame};
use crate::error::GatewayError;

/// One frame's worth of audio-feature embedding
pub type FeatureChunk = Vec<f32>;

/// Precomputed VAE latent for one avatar frame
#[derive(Debug, Clone)]
pub struct Latent(pub Vec<f32>);

/// Whisper-family audio feature extraction
pub trait AudioFeatureExtractor: Send + Sync {
    /// Embed a PCM window (16 kHz mono f32) into the feature space
    fn audio2feat(&self, pcm: &[f32]) -> Result<Vec<f32>, GatewayError>;

    /// Split a feature array into per-video-frame chunks
    ///
    /// `fps` is the video frame rate (half the audio chunk rate), `start` the
    /// offset into the window contributed by left context.
    fn feature2chunks(
        &self,
        features: &[f32],
        fps: f64,
        batch_size: usize,
        start: f64,
    ) -> Vec<FeatureChunk>;
}

/// Denoising U-Net + VAE pair
pub trait LipSyncModel: Send + Sync {
    /// Read the precomputed latent cycle from the avatar bundle.
    /// `cycle_len` is the frame-cycle length the latents must align with.
    fn load_latents(&self, path: &Path, cycle_len: usize) -> Result<Vec<Latent>, GatewayError>;

    /// One denoising step conditioned on the audio-feature embedding
    fn unet(
        &self,
        latents: &[Latent],
        timestep: i64,
        audio_features: &[FeatureChunk],
    ) -> Result<Vec<Latent>, GatewayError>;

    /// Decode latents to mouth-region images (BGR, model-native resolution)
    fn decode_latents(&self, latents: &[Latent]) -> Result<Vec<Frame>, GatewayError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Blending
// ─────────────────────────────────────────────────────────────────────────────

/// Composite a generated mouth region into the original frame.
///
/// `face` must already be resized to the bounding-box dimensions. The mask is
/// frame-aligned; its `mask_box` crop is scaled onto the bounding box and
/// used as a per-pixel alpha.
pub fn blend(
    original: &Frame,
    face: &Frame,
    bbox: BoundingBox,
    mask: &Frame,
    mask_box: BoundingBox,
) -> Result<Frame, GatewayError> {
    let (bw, bh) = bbox.dimensions();
    if face.width != bw || face.height != bh {
        return Err(GatewayError::Upstream(format!(
            "face patch {}x{} does not match bbox {}x{}",
            face.width, face.height, bw, bh
        )));
    }
    if bbox.x2 > original.width || bbox.y2 > original.height {
        return Err(GatewayError::Upstream(format!(
            "bbox {:?} outside frame {}x{}",
            bbox, original.width, original.height
        )));
    }

    let alpha = mask.crop(mask_box)?.resized(bw, bh);
    let mut out = original.clone_data();

    for y in 0..bh {
        for x in 0..bw {
            let a = alpha.pixel(x, y)[0] as u32; // grayscale mask, take one channel
            let fx = face.pixel(x, y);
            let ox = bbox.x1 + x;
            let oy = bbox.y1 + y;
            let base = ((oy * original.width + ox) * 3) as usize;
            for c in 0..3 {
                let orig = out[base + c] as u32;
                let gen = fx[c] as u32;
                out[base + c] = ((gen * a + orig * (255 - a)) / 255) as u8;
            }
        }
    }

    Ok(Frame::from_raw(original.width, original.height, out))
}

// ─────────────────────────────────────────────────────────────────────────────
// Mocks
// ─────────────────────────────────────────────────────────────────────────────

/// Feature dimension of the mock embedding
const MOCK_FEATURE_DIM: usize = 8;

/// Deterministic feature extractor: per-frame energy statistics
pub struct MockFeatureExtractor;

impl AudioFeatureExtractor for MockFeatureExtractor {
    fn audio2feat(&self, pcm: &[f32]) -> Result<Vec<f32>, GatewayError> {
        // One MOCK_FEATURE_DIM-wide row per 640 samples (one video frame at
        // 25 fps), filled with windowed energy so silence maps to zeros.
        let window = 640;
        let rows = pcm.len().div_ceil(window).max(1);
        let mut out = Vec::with_capacity(rows * MOCK_FEATURE_DIM);
        for r in 0..rows {
            let slice = &pcm[(r * window).min(pcm.len())..((r + 1) * window).min(pcm.len())];
            let energy = if slice.is_empty() {
                0.0
            } else {
                slice.iter().map(|s| s * s).sum::<f32>() / slice.len() as f32
            };
            for d in 0..MOCK_FEATURE_DIM {
                out.push(energy * (d + 1) as f32);
            }
        }
        Ok(out)
    }

    fn feature2chunks(
        &self,
        features: &[f32],
        _fps: f64,
        batch_size: usize,
        start: f64,
    ) -> Vec<FeatureChunk> {
        let rows = features.len() / MOCK_FEATURE_DIM;
        let first = (start as usize).min(rows.saturating_sub(1));
        (0..batch_size)
            .map(|i| {
                let row = (first + i).min(rows.saturating_sub(1));
                features[row * MOCK_FEATURE_DIM..(row + 1) * MOCK_FEATURE_DIM].to_vec()
            })
            .collect()
    }
}

/// Resolution of the mock VAE's mouth patches
const MOCK_PATCH_SIZE: u32 = 256;

/// Deterministic model: identity U-Net, flat gray VAE output
pub struct MockLipSyncModel;

impl LipSyncModel for MockLipSyncModel {
    fn load_latents(&self, _path: &Path, cycle_len: usize) -> Result<Vec<Latent>, GatewayError> {
        Ok((0..cycle_len).map(|_| Latent(vec![0.0; 16])).collect())
    }

    fn unet(
        &self,
        latents: &[Latent],
        _timestep: i64,
        audio_features: &[FeatureChunk],
    ) -> Result<Vec<Latent>, GatewayError> {
        if latents.len() != audio_features.len() {
            return Err(GatewayError::Upstream(format!(
                "latent batch {} does not match feature batch {}",
                latents.len(),
                audio_features.len()
            )));
        }
        Ok(latents.to_vec())
    }

    fn decode_latents(&self, latents: &[Latent]) -> Result<Vec<Frame>, GatewayError> {
        Ok(latents
            .iter()
            .map(|_| Frame::solid(MOCK_PATCH_SIZE, MOCK_PATCH_SIZE, [128, 128, 128]))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_embeds_to_zero_features() {
        let extractor = MockFeatureExtractor;
        let features = extractor.audio2feat(&vec![0.0f32; 6400]).unwrap();
        assert!(features.iter().all(|f| *f == 0.0));

        let loud = extractor.audio2feat(&vec![0.5f32; 6400]).unwrap();
        assert!(loud.iter().any(|f| *f > 0.0));
    }

    #[test]
    fn feature2chunks_yields_batch_size_chunks() {
        let extractor = MockFeatureExtractor;
        let features = extractor.audio2feat(&vec![0.1f32; 320 * 32]).unwrap();
        let chunks = extractor.feature2chunks(&features, 25.0, 8, 2.0);
        assert_eq!(chunks.len(), 8);
        assert!(chunks.iter().all(|c| c.len() == MOCK_FEATURE_DIM));
    }

    #[test]
    fn blend_respects_mask_alpha() {
        let original = Frame::solid(8, 8, [0, 0, 0]);
        let face = Frame::solid(4, 4, [255, 255, 255]);
        let bbox = BoundingBox::new(2, 2, 6, 6);

        // Fully opaque mask: bbox pixels become the face, the rest stay
        let mask = Frame::solid(8, 8, [255, 255, 255]);
        let out = blend(&original, &face, bbox, &mask, BoundingBox::new(2, 2, 6, 6)).unwrap();
        assert_eq!(out.pixel(3, 3), [255, 255, 255]);
        assert_eq!(out.pixel(0, 0), [0, 0, 0]);

        // Fully transparent mask: nothing changes
        let mask = Frame::solid(8, 8, [0, 0, 0]);
        let out = blend(&original, &face, bbox, &mask, BoundingBox::new(2, 2, 6, 6)).unwrap();
        assert_eq!(out.pixel(3, 3), [0, 0, 0]);
    }

    #[test]
    fn blend_rejects_mismatched_patch() {
        let original = Frame::solid(8, 8, [0, 0, 0]);
        let face = Frame::solid(3, 3, [255, 255, 255]);
        let mask = Frame::solid(8, 8, [255, 255, 255]);
        let bbox = BoundingBox::new(2, 2, 6, 6);
        assert!(blend(&original, &face, bbox, &mask, bbox).is_err());
    }
}
