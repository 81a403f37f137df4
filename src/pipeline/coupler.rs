//! Output coupler: lip-sync engine output -> media tracks
//!
//! One pump per realtime request. Drains the engine's frame+audio pairs and
//! feeds them to the media session's track queues, firing the A/V sync latch
//! once a small prebuffer of real frames has accumulated so playback starts
//! smooth instead of starving the paced tracks on frame one.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;

use crate::pipeline::StreamingLipSync;
use crate::media::MediaSession;

/// Idle gap that ends a request once frames have flowed
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Polls of DRAIN_TIMEOUT to wait for the first frame (covers model and
/// synthesis warm-up)
const FIRST_FRAME_POLLS: u32 = 45;

/// Collect one utterance's frames and reconstructed PCM from an engine.
///
/// Blocking; used by background video generation, where the output becomes
/// an encoded clip instead of track traffic. Bounded to a minute of frames.
pub fn collect_clip(engine: &StreamingLipSync, text: &str) -> (Vec<crate::avatar::Frame>, Vec<f32>) {
    const MAX_FRAMES: usize = 25 * 60;

    let frames_rx = engine.frames();
    engine.flush();
    engine.speak(text);

    let mut frames = Vec::new();
    let mut pcm = Vec::new();
    let mut dry_polls = 0u32;

    loop {
        match frames_rx.recv_timeout(DRAIN_TIMEOUT) {
            Ok(pair) => {
                dry_polls = 0;
                for chunk in &pair.audio {
                    pcm.extend_from_slice(&chunk.samples);
                }
                let ended = pair.is_end();
                frames.push(pair.frame);
                if ended || frames.len() >= MAX_FRAMES {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if !frames.is_empty() {
                    break;
                }
                dry_polls += 1;
                if dry_polls >= FIRST_FRAME_POLLS {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    (frames, pcm)
}

/// Pump one request's frames into the media session. Returns the number of
/// frames delivered.
pub async fn pump_to_media(
    engine: Arc<StreamingLipSync>,
    session: Arc<MediaSession>,
    prebuffer: usize,
) -> usize {
    let avatar_id = engine.avatar_id.clone();
    let frames = engine.frames();

    let delivered = tokio::task::spawn_blocking(move || {
        let mut count = 0usize;
        let mut dry_polls = 0u32;

        loop {
            match frames.recv_timeout(DRAIN_TIMEOUT) {
                Ok(pair) => {
                    dry_polls = 0;
                    let ended = pair.is_end();

                    // Audio first: each frame's two chunks precede it in the
                    // output stream
                    for chunk in &pair.audio {
                        session.feed_audio_chunk(chunk.samples.clone());
                    }
                    session.feed_frame(pair.frame);
                    count += 1;

                    if count == 1 {
                        tracing::info!(avatar_id = %avatar_id, "First frame coupled");
                    }
                    if count == prebuffer && session.sync.latch() {
                        tracing::info!(avatar_id = %avatar_id, prebuffer, "A/V sync latched");
                    }

                    if ended {
                        // Short utterance: latch anyway so playback starts
                        if count < prebuffer && session.sync.latch() {
                            tracing::info!(avatar_id = %avatar_id, count, "A/V sync latched at end");
                        }
                        tracing::info!(avatar_id = %avatar_id, count, "Stream complete");
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if count > 0 {
                        // Stream went quiet without a terminator (flushed)
                        tracing::info!(avatar_id = %avatar_id, count, "Stream drained on timeout");
                        break;
                    }
                    dry_polls += 1;
                    if dry_polls >= FIRST_FRAME_POLLS {
                        tracing::warn!(avatar_id = %avatar_id, "No frames produced, giving up");
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        count
    })
    .await
    .unwrap_or(0);

    delivered
}
