// Avatar asset bundles and the idle-frame source
//
// Each avatar is a preprocessed directory produced offline:
//   full_imgs/      numbered PNGs of the base frames
//   mask/           numbered PNGs aligned with the frames
//   coords.pkl      one face bounding box per frame
//   mask_coords.pkl one mask crop box per frame
//   latents.pt      precomputed neural latents (read via the model)
//   avatar_info.txt optional metadata, ignored here
//
// Everything loaded from a bundle is immutable afterwards and shared across
// sessions without locking.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use image::{ImageBuffer, Rgb};

use crate::config::AvatarConfig;
use crate::error::GatewayError;
use crate::process::ScopedChild;

pub mod model;

use model::{Latent, LipSyncModel};

/// Idle bank size: 5 seconds at 25 fps
pub const IDLE_FRAME_COUNT: usize = 125;

/// Video frame rate of every avatar bundle
pub const VIDEO_FPS: u32 = 25;

// ─────────────────────────────────────────────────────────────────────────────
// Frame
// ─────────────────────────────────────────────────────────────────────────────

/// One decoded frame, 8-bit BGR, tightly packed
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    data: Bytes,
}

impl Frame {
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), (width * height * 3) as usize);
        Self {
            width,
            height,
            data: Bytes::from(data),
        }
    }

    /// Uniform-color frame (tests and mock patches)
    pub fn solid(width: u32, height: u32, bgr: [u8; 3]) -> Self {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for _ in 0..width * height {
            data.extend_from_slice(&bgr);
        }
        Self::from_raw(width, height, data)
    }

    /// Decode a PNG/JPEG file, converting to BGR channel order
    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        let img = image::open(path)
            .map_err(|e| GatewayError::Upstream(format!("failed to read {}: {e}", path.display())))?
            .to_rgb8();
        let (width, height) = img.dimensions();
        let mut data = img.into_raw();
        for px in data.chunks_exact_mut(3) {
            px.swap(0, 2);
        }
        Ok(Self::from_raw(width, height, data))
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn clone_data(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let base = ((y * self.width + x) * 3) as usize;
        [self.data[base], self.data[base + 1], self.data[base + 2]]
    }

    /// Crop to a bounding box
    pub fn crop(&self, bbox: BoundingBox) -> Result<Frame, GatewayError> {
        if bbox.x2 > self.width || bbox.y2 > self.height || bbox.x1 >= bbox.x2 || bbox.y1 >= bbox.y2
        {
            return Err(GatewayError::Upstream(format!(
                "crop {:?} outside frame {}x{}",
                bbox, self.width, self.height
            )));
        }
        let (w, h) = bbox.dimensions();
        let mut out = Vec::with_capacity((w * h * 3) as usize);
        for y in bbox.y1..bbox.y2 {
            let start = ((y * self.width + bbox.x1) * 3) as usize;
            let end = start + (w * 3) as usize;
            out.extend_from_slice(&self.data[start..end]);
        }
        Ok(Frame::from_raw(w, h, out))
    }

    /// Bilinear resize. Channel order is irrelevant to the interpolation, so
    /// the BGR payload rides through an RGB-typed buffer unchanged.
    pub fn resized(&self, width: u32, height: u32) -> Frame {
        if width == self.width && height == self.height {
            return self.clone();
        }
        let buf: ImageBuffer<Rgb<u8>, Vec<u8>> =
            ImageBuffer::from_raw(self.width, self.height, self.data.to_vec())
                .expect("frame payload matches dimensions");
        let resized =
            image::imageops::resize(&buf, width, height, image::imageops::FilterType::Triangle);
        Frame::from_raw(width, height, resized.into_raw())
    }
}

/// Inclusive-exclusive pixel box `[x1, x2) x [y1, y2)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BoundingBox {
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.x2.saturating_sub(self.x1), self.y2.saturating_sub(self.y1))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Asset bundle
// ─────────────────────────────────────────────────────────────────────────────

/// Immutable cyclic data for one avatar: four parallel arrays of equal
/// length, indexed through mirror-indexing by the pipeline
pub struct AvatarAssets {
    pub avatar_id: String,
    pub frames: Vec<Frame>,
    pub masks: Vec<Frame>,
    pub coords: Vec<BoundingBox>,
    pub mask_coords: Vec<BoundingBox>,
    pub latents: Vec<Latent>,
}

impl AvatarAssets {
    /// Length of the frame cycle (== every other cycle)
    pub fn cycle_len(&self) -> usize {
        self.frames.len()
    }

    pub fn load(
        avatar_id: &str,
        avatar_path: &Path,
        model: &dyn LipSyncModel,
    ) -> Result<Self, GatewayError> {
        let frames = load_numbered_frames(&avatar_path.join("full_imgs"))?;
        if frames.is_empty() {
            return Err(GatewayError::NotFound(format!(
                "avatar {avatar_id} has no frames"
            )));
        }
        let masks = load_numbered_frames(&avatar_path.join("mask"))?;
        let coords = load_boxes(&avatar_path.join("coords.pkl"))?;
        let mask_coords = load_boxes(&avatar_path.join("mask_coords.pkl"))?;
        let latents = model.load_latents(&avatar_path.join("latents.pt"), frames.len())?;

        let cycle_len = frames.len();
        for (name, len) in [
            ("mask", masks.len()),
            ("coords", coords.len()),
            ("mask_coords", mask_coords.len()),
            ("latents", latents.len()),
        ] {
            if len != cycle_len {
                return Err(GatewayError::Upstream(format!(
                    "avatar {avatar_id}: {name} cycle has {len} entries, frames have {cycle_len}"
                )));
            }
        }

        tracing::info!(avatar_id, frames = cycle_len, "Avatar assets loaded");

        Ok(Self {
            avatar_id: avatar_id.to_string(),
            frames,
            masks,
            coords,
            mask_coords,
            latents,
        })
    }
}

/// Read every numbered image in a directory, ordered by numeric stem
fn load_numbered_frames(dir: &Path) -> Result<Vec<Frame>, GatewayError> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| GatewayError::NotFound(format!("{}: {e}", dir.display())))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("png") | Some("jpg") | Some("jpeg")
            )
        })
        .collect();
    paths.sort_by_key(|p| numeric_stem(p));

    paths.iter().map(|p| Frame::load(p)).collect()
}

/// Sort key for frame filenames: numeric stem when parseable, else max
fn numeric_stem(path: &Path) -> (u64, String) {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();
    (stem.parse::<u64>().unwrap_or(u64::MAX), stem)
}

/// Read a pickled list of 4-int boxes
fn load_boxes(path: &Path) -> Result<Vec<BoundingBox>, GatewayError> {
    let file = std::fs::File::open(path)
        .map_err(|e| GatewayError::NotFound(format!("{}: {e}", path.display())))?;
    let raw: Vec<Vec<i64>> = serde_pickle::from_reader(file, serde_pickle::DeOptions::new())
        .map_err(|e| GatewayError::Upstream(format!("failed to parse {}: {e}", path.display())))?;

    raw.into_iter()
        .map(|b| {
            if b.len() != 4 || b.iter().any(|v| *v < 0) {
                return Err(GatewayError::Upstream(format!(
                    "malformed box {b:?} in {}",
                    path.display()
                )));
            }
            Ok(BoundingBox::new(b[0] as u32, b[1] as u32, b[2] as u32, b[3] as u32))
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Process-wide avatar store: idle-frame banks and asset bundles, cached per
/// avatar id and shared across sessions
pub struct AvatarManager {
    avatars_dir: PathBuf,
    ffmpeg_path: String,
    idle_banks: Mutex<HashMap<String, Arc<Vec<Frame>>>>,
    assets: Mutex<HashMap<String, Arc<AvatarAssets>>>,
}

impl AvatarManager {
    pub fn new(config: &AvatarConfig) -> Self {
        Self {
            avatars_dir: config.avatars_dir.clone(),
            ffmpeg_path: config.ffmpeg_path.clone(),
            idle_banks: Mutex::new(HashMap::new()),
            assets: Mutex::new(HashMap::new()),
        }
    }

    pub fn avatar_path(&self, avatar_id: &str) -> PathBuf {
        self.avatars_dir.join(avatar_id)
    }

    /// Idle frames for an avatar: at most IDLE_FRAME_COUNT frames from
    /// full_imgs/ (falling back to the avatar root), filename order.
    pub fn idle_frames(&self, avatar_id: &str) -> Result<Arc<Vec<Frame>>, GatewayError> {
        if let Some(bank) = self
            .idle_banks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(avatar_id)
        {
            return Ok(Arc::clone(bank));
        }

        let avatar_path = self.avatar_path(avatar_id);
        if !avatar_path.is_dir() {
            return Err(GatewayError::NotFound(format!("avatar {avatar_id}")));
        }
        let full_imgs = avatar_path.join("full_imgs");
        let search_dir = if full_imgs.is_dir() { full_imgs } else { avatar_path };

        let mut frames = load_numbered_frames(&search_dir)?;
        frames.truncate(IDLE_FRAME_COUNT);
        if frames.is_empty() {
            return Err(GatewayError::NotFound(format!(
                "avatar {avatar_id} has no idle frames"
            )));
        }
        tracing::info!(avatar_id, count = frames.len(), "Loaded idle frames");

        let bank = Arc::new(frames);
        self.idle_banks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(avatar_id.to_string(), Arc::clone(&bank));
        Ok(bank)
    }

    /// Full asset bundle for the lip-sync pipeline
    pub fn assets(
        &self,
        avatar_id: &str,
        model: &dyn LipSyncModel,
    ) -> Result<Arc<AvatarAssets>, GatewayError> {
        if let Some(assets) = self
            .assets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(avatar_id)
        {
            return Ok(Arc::clone(assets));
        }

        let avatar_path = self.avatar_path(avatar_id);
        if !avatar_path.is_dir() {
            return Err(GatewayError::NotFound(format!("avatar {avatar_id}")));
        }
        let assets = Arc::new(AvatarAssets::load(avatar_id, &avatar_path, model)?);
        self.assets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(avatar_id.to_string(), Arc::clone(&assets));
        Ok(assets)
    }

    /// Render the idle bank into an MP4 clip for inline delivery.
    ///
    /// Blocking (external encoder); callers on the async control plane go
    /// through `spawn_blocking`.
    pub fn render_idle_clip(&self, avatar_id: &str) -> Result<Vec<u8>, GatewayError> {
        let frames = self.idle_frames(avatar_id)?;
        let first = &frames[0];

        let child = Command::new(&self.ffmpeg_path)
            .args([
                "-y",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "bgr24",
                "-s",
                &format!("{}x{}", first.width, first.height),
                "-r",
                &VIDEO_FPS.to_string(),
                "-i",
                "-",
                "-an",
                "-vcodec",
                "libx264",
                "-pix_fmt",
                "yuv420p",
                "-movflags",
                "frag_keyframe+empty_moov",
                "-f",
                "mp4",
                "-",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| GatewayError::Upstream(format!("failed to spawn encoder: {e}")))?;
        let mut child = ScopedChild::new(child, "ffmpeg-encode");

        let mut stdin = child
            .inner_mut()
            .stdin
            .take()
            .ok_or_else(|| GatewayError::Upstream("encoder stdin unavailable".into()))?;
        let mut stdout = child
            .inner_mut()
            .stdout
            .take()
            .ok_or_else(|| GatewayError::Upstream("encoder stdout unavailable".into()))?;

        // Feed frames on a side thread while draining stdout, or the pipe
        // buffers deadlock on long clips
        let feed_frames = Arc::clone(&frames);
        let writer = std::thread::spawn(move || -> std::io::Result<()> {
            for frame in feed_frames.iter() {
                stdin.write_all(frame.data())?;
            }
            Ok(())
        });

        let mut clip = Vec::new();
        stdout
            .read_to_end(&mut clip)
            .map_err(|e| GatewayError::Upstream(format!("encoder read failed: {e}")))?;

        if let Err(e) = writer.join().unwrap_or_else(|_| {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "writer panicked"))
        }) {
            tracing::warn!(avatar_id, "encoder feed ended early: {e}");
        }

        let status = child
            .wait()
            .map_err(|e| GatewayError::Upstream(format!("encoder wait failed: {e}")))?;
        if !status.success() || clip.is_empty() {
            return Err(GatewayError::Upstream(format!(
                "encoder exited with {status}"
            )));
        }

        tracing::info!(avatar_id, bytes = clip.len(), "Idle clip rendered");
        Ok(clip)
    }

    /// Mux generated frames and their reconstructed PCM into an MP4 clip.
    ///
    /// Blocking (external encoder). The audio rides a temporary WAV file
    /// because the encoder only takes one piped input.
    pub fn render_speech_clip(&self, frames: &[Frame], pcm: &[f32]) -> Result<Vec<u8>, GatewayError> {
        let first = frames
            .first()
            .ok_or_else(|| GatewayError::Upstream("no frames to encode".into()))?;

        let samples: Vec<i16> = pcm
            .iter()
            .map(|s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
            .collect();
        let wav_path = std::env::temp_dir().join(format!("tutorgw-{}.wav", uuid::Uuid::new_v4()));
        std::fs::write(
            &wav_path,
            crate::engine::tts::encode_wav_mono16(&samples, 16_000),
        )
        .map_err(|e| GatewayError::Upstream(format!("failed to stage audio: {e}")))?;

        let result = self.mux_clip(frames, first, &wav_path);
        let _ = std::fs::remove_file(&wav_path);
        result
    }

    fn mux_clip(
        &self,
        frames: &[Frame],
        first: &Frame,
        wav_path: &Path,
    ) -> Result<Vec<u8>, GatewayError> {
        let child = Command::new(&self.ffmpeg_path)
            .args([
                "-y",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "bgr24",
                "-s",
                &format!("{}x{}", first.width, first.height),
                "-r",
                &VIDEO_FPS.to_string(),
                "-i",
                "-",
            ])
            .arg("-i")
            .arg(wav_path)
            .args([
                "-map",
                "0:v",
                "-map",
                "1:a",
                "-vcodec",
                "libx264",
                "-pix_fmt",
                "yuv420p",
                "-acodec",
                "aac",
                "-shortest",
                "-movflags",
                "frag_keyframe+empty_moov",
                "-f",
                "mp4",
                "-",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| GatewayError::Upstream(format!("failed to spawn encoder: {e}")))?;
        let mut child = ScopedChild::new(child, "ffmpeg-mux");

        let mut stdin = child
            .inner_mut()
            .stdin
            .take()
            .ok_or_else(|| GatewayError::Upstream("encoder stdin unavailable".into()))?;
        let mut stdout = child
            .inner_mut()
            .stdout
            .take()
            .ok_or_else(|| GatewayError::Upstream("encoder stdout unavailable".into()))?;

        let feed: Vec<Bytes> = frames.iter().map(|f| f.data().clone()).collect();
        let writer = std::thread::spawn(move || -> std::io::Result<()> {
            for data in feed {
                stdin.write_all(&data)?;
            }
            Ok(())
        });

        let mut clip = Vec::new();
        stdout
            .read_to_end(&mut clip)
            .map_err(|e| GatewayError::Upstream(format!("encoder read failed: {e}")))?;
        let _ = writer.join();

        let status = child
            .wait()
            .map_err(|e| GatewayError::Upstream(format!("encoder wait failed: {e}")))?;
        if !status.success() || clip.is_empty() {
            return Err(GatewayError::Upstream(format!(
                "encoder exited with {status}"
            )));
        }
        Ok(clip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_crop_and_pixel_access() {
        let mut data = vec![0u8; 4 * 4 * 3];
        // Paint pixel (2,1) white
        let base = (1 * 4 + 2) * 3;
        data[base..base + 3].copy_from_slice(&[255, 255, 255]);
        let frame = Frame::from_raw(4, 4, data);

        assert_eq!(frame.pixel(2, 1), [255, 255, 255]);
        assert_eq!(frame.pixel(0, 0), [0, 0, 0]);

        let crop = frame.crop(BoundingBox::new(2, 1, 4, 3)).unwrap();
        assert_eq!((crop.width, crop.height), (2, 2));
        assert_eq!(crop.pixel(0, 0), [255, 255, 255]);
    }

    #[test]
    fn crop_outside_frame_is_rejected() {
        let frame = Frame::solid(4, 4, [1, 2, 3]);
        assert!(frame.crop(BoundingBox::new(0, 0, 5, 4)).is_err());
        assert!(frame.crop(BoundingBox::new(2, 2, 2, 4)).is_err());
    }

    #[test]
    fn resize_preserves_solid_color() {
        let frame = Frame::solid(8, 8, [10, 20, 30]);
        let resized = frame.resized(4, 4);
        assert_eq!((resized.width, resized.height), (4, 4));
        assert_eq!(resized.pixel(2, 2), [10, 20, 30]);
    }

    #[test]
    fn numeric_stem_ordering() {
        let mut paths = vec![
            PathBuf::from("/a/10.png"),
            PathBuf::from("/a/2.png"),
            PathBuf::from("/a/1.png"),
        ];
        paths.sort_by_key(|p| numeric_stem(p));
        assert_eq!(paths[0], PathBuf::from("/a/1.png"));
        assert_eq!(paths[1], PathBuf::from("/a/2.png"));
        assert_eq!(paths[2], PathBuf::from("/a/10.png"));
    }

    #[test]
    fn missing_avatar_is_not_found() {
        let manager = AvatarManager::new(&crate::config::AvatarConfig {
            avatars_dir: PathBuf::from("/nonexistent"),
            ..crate::config::AvatarConfig::default()
        });
        assert!(matches!(
            manager.idle_frames("avatar_tutor_1"),
            Err(GatewayError::NotFound(_))
        ));
    }
}
