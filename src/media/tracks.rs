//! Media track feeders: idle fallback, A/V sync latch, wall-clock pacing
//!
//! Both tracks share one start time `T0`, latched exactly once per media
//! session when the output coupler has prebuffered enough real frames.
//! Before the latch the tracks emit idle frames / silence on a fixed cadence
//! without advancing the paced timeline. After it, frame `n` is scheduled
//! for `T0 + n * interval` and the driver sleeps to that deadline before
//! writing, which yields constant-rate output at the transport regardless of
//! upstream jitter. That deadline discipline is what keeps the audio and
//! video streams from drifting apart.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::avatar::Frame;
use crate::pipeline::CHUNK_SAMPLES;

/// Video frame interval: 25 fps
pub const VIDEO_INTERVAL: Duration = Duration::from_millis(40);

/// Audio chunk interval: 50 chunks/s
pub const AUDIO_INTERVAL: Duration = Duration::from_millis(20);

// ─────────────────────────────────────────────────────────────────────────────
// Sync latch
// ─────────────────────────────────────────────────────────────────────────────

/// Shared wall-clock anchor, set exactly once per media session
#[derive(Debug, Default)]
pub struct AvSync {
    start: OnceLock<Instant>,
}

impl AvSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the anchor to now. Only the first call wins; returns whether
    /// this call was the one that set it.
    pub fn latch(&self) -> bool {
        let mut latched = false;
        self.start.get_or_init(|| {
            latched = true;
            Instant::now()
        });
        latched
    }

    /// The anchor, if latched
    pub fn start_time(&self) -> Option<Instant> {
        self.start.get().copied()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Drivers
// ─────────────────────────────────────────────────────────────────────────────

/// Drive the video track: real frames after the latch, idle frames before
/// and whenever the feed runs dry.
pub async fn drive_video(
    track: Arc<TrackLocalStaticSample>,
    mut feed: mpsc::UnboundedReceiver<Frame>,
    idle_frames: Arc<Vec<Frame>>,
    sync: Arc<AvSync>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut idle_index = 0usize;
    let mut frame_index = 0u32;

    loop {
        let deadline = match sync.start_time() {
            // Paced: frame n goes out no earlier than T0 + n * 40ms
            Some(t0) => t0 + VIDEO_INTERVAL * frame_index,
            // Idle cadence; the paced timeline is not advancing yet
            None => Instant::now() + VIDEO_INTERVAL,
        };

        tokio::select! {
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
        if *shutdown.borrow() {
            break;
        }

        let frame = if sync.start_time().is_some() {
            frame_index += 1;
            match feed.try_recv() {
                Ok(frame) => frame,
                Err(_) => next_idle(&idle_frames, &mut idle_index),
            }
        } else {
            next_idle(&idle_frames, &mut idle_index)
        };

        let sample = Sample {
            data: frame.data().clone(),
            duration: VIDEO_INTERVAL,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            tracing::debug!("video write_sample: {e}");
        }
    }

    tracing::debug!("Video track driver stopped");
}

/// Drive the audio track: 20 ms PCM chunks after the latch, silence before.
pub async fn drive_audio(
    track: Arc<TrackLocalStaticSample>,
    mut feed: mpsc::UnboundedReceiver<Vec<f32>>,
    sync: Arc<AvSync>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut chunk_index = 0u32;

    loop {
        let deadline = match sync.start_time() {
            Some(t0) => t0 + AUDIO_INTERVAL * chunk_index,
            None => Instant::now() + AUDIO_INTERVAL,
        };

        tokio::select! {
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
        if *shutdown.borrow() {
            break;
        }

        let samples = if sync.start_time().is_some() {
            chunk_index += 1;
            feed.try_recv().unwrap_or_else(|_| vec![0.0; CHUNK_SAMPLES])
        } else {
            vec![0.0; CHUNK_SAMPLES]
        };

        let sample = Sample {
            data: pcm_to_bytes(&samples),
            duration: AUDIO_INTERVAL,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            tracing::debug!("audio write_sample: {e}");
        }
    }

    tracing::debug!("Audio track driver stopped");
}

fn next_idle(idle_frames: &Arc<Vec<Frame>>, idle_index: &mut usize) -> Frame {
    if idle_frames.is_empty() {
        // No idle bank loaded yet: black frame
        return Frame::solid(512, 512, [0, 0, 0]);
    }
    let frame = idle_frames[*idle_index % idle_frames.len()].clone();
    *idle_index = (*idle_index + 1) % idle_frames.len();
    frame
}

/// f32 [-1, 1] to interleaved s16le
fn pcm_to_bytes(samples: &[f32]) -> Bytes {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        let v = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_fires_exactly_once() {
        let sync = AvSync::new();
        assert!(sync.start_time().is_none());

        assert!(sync.latch());
        let t0 = sync.start_time().unwrap();

        // Second latch is a no-op and the anchor is unchanged
        assert!(!sync.latch());
        assert_eq!(sync.start_time().unwrap(), t0);
    }

    #[test]
    fn latch_is_single_assignment_across_threads() {
        let sync = Arc::new(AvSync::new());
        let winners: usize = (0..8)
            .map(|_| {
                let sync = Arc::clone(&sync);
                std::thread::spawn(move || sync.latch())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        assert_eq!(winners, 1);
    }

    #[test]
    fn paced_deadlines_are_multiples_of_the_interval() {
        let t0 = Instant::now();
        let video_n3 = t0 + VIDEO_INTERVAL * 3;
        let audio_n6 = t0 + AUDIO_INTERVAL * 6;
        assert_eq!(video_n3 - t0, Duration::from_millis(120));
        assert_eq!(audio_n6 - t0, Duration::from_millis(120));
    }

    #[test]
    fn pcm_conversion_clamps_and_scales() {
        let bytes = pcm_to_bytes(&[0.0, 1.0, -1.0, 2.0]);
        let v0 = i16::from_le_bytes([bytes[0], bytes[1]]);
        let v1 = i16::from_le_bytes([bytes[2], bytes[3]]);
        let v2 = i16::from_le_bytes([bytes[4], bytes[5]]);
        let v3 = i16::from_le_bytes([bytes[6], bytes[7]]);
        assert_eq!(v0, 0);
        assert_eq!(v1, 32767);
        assert_eq!(v2, -32767);
        assert_eq!(v3, 32767); // clamped
    }

    #[test]
    fn idle_bank_cycles() {
        let bank = Arc::new(vec![
            Frame::solid(2, 2, [1, 0, 0]),
            Frame::solid(2, 2, [2, 0, 0]),
        ]);
        let mut idx = 0;
        assert_eq!(next_idle(&bank, &mut idx).pixel(0, 0), [1, 0, 0]);
        assert_eq!(next_idle(&bank, &mut idx).pixel(0, 0), [2, 0, 0]);
        assert_eq!(next_idle(&bank, &mut idx).pixel(0, 0), [1, 0, 0]);
    }
}
