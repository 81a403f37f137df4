//! Inference and blending worker
//!
//! Consumes feature batches, keeps the audio timeline aligned by pulling the
//! matching chunk pairs from the reconstruction queue, and emits composited
//! frames. Silence-only batches bypass the neural step entirely and emit the
//! original avatar cycle, so an idle avatar costs no model time. The logical
//! frame index advances on every emitted frame and resets at utterance
//! boundaries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};

use crate::avatar::model::{blend, FeatureChunk, Latent, LipSyncModel};
use crate::avatar::{AvatarAssets, Frame};
use crate::pipeline::{mirror_index, AudioChunk, ChunkKind, FramePair, MarkerStatus};

/// Feature-queue poll; re-looped on timeout per the pipeline contract
const FEAT_POLL: Duration = Duration::from_secs(1);

/// Poll used for the blocking audio pull and frame push so quit lands fast
const IO_POLL: Duration = Duration::from_millis(100);

pub struct InferenceWorker {
    pub avatar_id: String,
    pub batch_size: usize,
    pub feat_rx: Receiver<Vec<FeatureChunk>>,
    pub audio_out_rx: Receiver<AudioChunk>,
    pub frame_tx: Sender<FramePair>,
    pub assets: Arc<AvatarAssets>,
    pub model: Arc<dyn LipSyncModel>,
    pub quit: Arc<AtomicBool>,
    pub render: Arc<AtomicBool>,
}

pub fn spawn(worker: InferenceWorker) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("infer-{}", worker.avatar_id))
        .spawn(move || run(worker))
        .expect("spawn inference worker")
}

fn run(worker: InferenceWorker) {
    tracing::info!(avatar_id = %worker.avatar_id, "Inference loop started");

    let cycle_len = worker.assets.cycle_len();
    let mut index: usize = 0;
    let mut emitted: u64 = 0;

    while !worker.quit.load(Ordering::SeqCst) {
        // The render gate distinguishes flush (gate stays up, queues drain)
        // from stop (gate drops, loop exits via quit)
        if !worker.render.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(50));
            continue;
        }

        let features = match worker.feat_rx.recv_timeout(FEAT_POLL) {
            Ok(features) => features,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        // Two audio chunks per frame, placed there by the extractor; pulling
        // them here keeps playback aligned with the frames about to exist
        let mut audio = Vec::with_capacity(worker.batch_size * 2);
        let mut disconnected = false;
        for _ in 0..worker.batch_size * 2 {
            match pull_audio(&worker) {
                Some(chunk) => audio.push(chunk),
                None => {
                    disconnected = true;
                    break;
                }
            }
        }
        if disconnected {
            break;
        }

        let all_silence = audio.iter().all(|c| c.kind == ChunkKind::Silence);
        let utterance_end: Option<String> = audio.iter().find_map(|c| {
            c.marker
                .as_ref()
                .filter(|m| m.status == MarkerStatus::End)
                .map(|m| m.text.clone())
        });

        if all_silence {
            // Idle: original cycle, no neural step; the index still advances
            for i in 0..worker.batch_size {
                let idx = mirror_index(cycle_len, index);
                let pair = FramePair {
                    frame: worker.assets.frames[idx].clone(),
                    audio: audio[i * 2..i * 2 + 2].to_vec(),
                };
                if !push_pair(&worker, pair) {
                    return;
                }
                index += 1;
                emitted += 1;
            }
        } else {
            let patches = infer_batch(&worker, index, cycle_len, &features);
            for i in 0..worker.batch_size {
                let idx = mirror_index(cycle_len, index);
                let frame = match &patches {
                    Some(patches) => composite(&worker, idx, &patches[i]),
                    // Model failure: audio still flows over original frames
                    None => worker.assets.frames[idx].clone(),
                };
                let pair = FramePair {
                    frame,
                    audio: audio[i * 2..i * 2 + 2].to_vec(),
                };
                if !push_pair(&worker, pair) {
                    return;
                }
                index += 1;
                emitted += 1;
            }
        }

        if emitted >= 100 {
            tracing::debug!(avatar_id = %worker.avatar_id, index, "Emitted {} frames", emitted);
            emitted = 0;
        }

        // Cycle position restarts between requests
        if let Some(text) = utterance_end {
            tracing::debug!(avatar_id = %worker.avatar_id, text, "Utterance complete");
            index = 0;
        }
    }

    tracing::info!(avatar_id = %worker.avatar_id, "Inference loop stopped");
}

/// One neural step: gather latents along the mirrored cycle, denoise, decode.
/// Any failure falls back to the original frames for this batch only.
fn infer_batch(
    worker: &InferenceWorker,
    index: usize,
    cycle_len: usize,
    features: &[FeatureChunk],
) -> Option<Vec<Frame>> {
    if features.len() != worker.batch_size {
        tracing::error!(
            avatar_id = %worker.avatar_id,
            got = features.len(),
            want = worker.batch_size,
            "Feature batch size mismatch"
        );
        return None;
    }

    let latents: Vec<Latent> = (0..worker.batch_size)
        .map(|i| worker.assets.latents[mirror_index(cycle_len, index + i)].clone())
        .collect();

    let patches = worker
        .model
        .unet(&latents, 0, features)
        .and_then(|denoised| worker.model.decode_latents(&denoised));

    match patches {
        Ok(patches) if patches.len() == worker.batch_size => Some(patches),
        Ok(patches) => {
            tracing::error!(
                avatar_id = %worker.avatar_id,
                got = patches.len(),
                "Decoder returned wrong patch count"
            );
            None
        }
        Err(e) => {
            tracing::error!(avatar_id = %worker.avatar_id, "Inference failed: {e}");
            None
        }
    }
}

/// Resize the mouth patch to the cached bounding box and blend it into the
/// original frame. A blending failure falls back to the original frame.
fn composite(worker: &InferenceWorker, idx: usize, patch: &Frame) -> Frame {
    let assets = &worker.assets;
    let bbox = assets.coords[idx];
    let (w, h) = bbox.dimensions();
    let resized = patch.resized(w, h);

    match blend(
        &assets.frames[idx],
        &resized,
        bbox,
        &assets.masks[idx],
        assets.mask_coords[idx],
    ) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(avatar_id = %worker.avatar_id, idx, "Blending failed: {e}");
            assets.frames[idx].clone()
        }
    }
}

fn pull_audio(worker: &InferenceWorker) -> Option<AudioChunk> {
    loop {
        match worker.audio_out_rx.recv_timeout(IO_POLL) {
            Ok(chunk) => return Some(chunk),
            Err(RecvTimeoutError::Timeout) => {
                if worker.quit.load(Ordering::SeqCst) {
                    return None;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}

/// Bounded push toward the coupler; blocking here is how backpressure
/// reaches inference. Returns false when the worker should exit.
fn push_pair(worker: &InferenceWorker, pair: FramePair) -> bool {
    let mut pending = pair;
    loop {
        match worker.frame_tx.send_timeout(pending, IO_POLL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => {
                if worker.quit.load(Ordering::SeqCst) {
                    return false;
                }
                pending = back;
            }
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avatar::model::{MockFeatureExtractor, MockLipSyncModel, AudioFeatureExtractor};
    use crate::avatar::BoundingBox;
    use crate::pipeline::CHUNK_SAMPLES;
    use crossbeam_channel::{bounded, unbounded};

    fn test_assets(cycle_len: usize) -> Arc<AvatarAssets> {
        let model = MockLipSyncModel;
        Arc::new(AvatarAssets {
            avatar_id: "test".into(),
            frames: (0..cycle_len)
                .map(|i| Frame::solid(32, 32, [i as u8, 0, 0]))
                .collect(),
            masks: (0..cycle_len).map(|_| Frame::solid(32, 32, [255, 255, 255])).collect(),
            coords: (0..cycle_len).map(|_| BoundingBox::new(8, 8, 24, 24)).collect(),
            mask_coords: (0..cycle_len).map(|_| BoundingBox::new(8, 8, 24, 24)).collect(),
            latents: model
                .load_latents(std::path::Path::new("unused"), cycle_len)
                .unwrap(),
        })
    }

    struct Fixture {
        feat_tx: Sender<Vec<FeatureChunk>>,
        audio_tx: Sender<AudioChunk>,
        frame_rx: Receiver<FramePair>,
        quit: Arc<AtomicBool>,
        handle: JoinHandle<()>,
    }

    fn start(batch_size: usize, cycle_len: usize) -> Fixture {
        let (feat_tx, feat_rx) = bounded(2);
        let (audio_tx, audio_out_rx) = unbounded();
        let (frame_tx, frame_rx) = bounded(batch_size * 4);
        let quit = Arc::new(AtomicBool::new(false));
        let render = Arc::new(AtomicBool::new(true));
        let handle = spawn(InferenceWorker {
            avatar_id: "test".into(),
            batch_size,
            feat_rx,
            audio_out_rx,
            frame_tx,
            assets: test_assets(cycle_len),
            model: Arc::new(MockLipSyncModel),
            quit: Arc::clone(&quit),
            render,
        });
        Fixture {
            feat_tx,
            audio_tx,
            frame_rx,
            quit,
            handle,
        }
    }

    fn feature_batch(batch_size: usize) -> Vec<FeatureChunk> {
        let extractor = MockFeatureExtractor;
        let features = extractor.audio2feat(&vec![0.2f32; CHUNK_SAMPLES * 16]).unwrap();
        extractor.feature2chunks(&features, 25.0, batch_size, 2.0)
    }

    #[test]
    fn silence_batches_emit_original_cycle_frames() {
        let batch = 4;
        let fixture = start(batch, 8);

        for _ in 0..batch * 2 {
            fixture.audio_tx.send(AudioChunk::silence()).unwrap();
        }
        fixture.feat_tx.send(feature_batch(batch)).unwrap();

        for i in 0..batch {
            let pair = fixture
                .frame_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("frame pair");
            // Original frame i of the cycle: solid [i, 0, 0]
            assert_eq!(pair.frame.pixel(0, 0), [i as u8, 0, 0]);
            assert_eq!(pair.audio.len(), 2);
        }

        fixture.quit.store(true, Ordering::SeqCst);
        fixture.handle.join().unwrap();
    }

    #[test]
    fn each_feature_batch_yields_batch_size_pairs_in_order() {
        let batch = 4;
        let fixture = start(batch, 8);
        let rounds = 3;

        for _ in 0..rounds {
            for _ in 0..batch * 2 {
                fixture
                    .audio_tx
                    .send(AudioChunk::voice(vec![0.2; CHUNK_SAMPLES], None))
                    .unwrap();
            }
            fixture.feat_tx.send(feature_batch(batch)).unwrap();
        }

        let mut received = 0;
        while received < rounds * batch {
            fixture
                .frame_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("frame pair");
            received += 1;
        }
        assert_eq!(received, rounds * batch);

        fixture.quit.store(true, Ordering::SeqCst);
        fixture.handle.join().unwrap();
    }

    #[test]
    fn end_marker_resets_the_frame_index() {
        let batch = 2;
        let fixture = start(batch, 16);

        // First voiced batch with an end marker on the last chunk
        for i in 0..batch * 2 {
            let marker = (i == batch * 2 - 1).then(|| crate::pipeline::Marker {
                status: MarkerStatus::End,
                text: "utterance".into(),
            });
            fixture
                .audio_tx
                .send(AudioChunk::voice(vec![0.2; CHUNK_SAMPLES], marker))
                .unwrap();
        }
        fixture.feat_tx.send(feature_batch(batch)).unwrap();
        for _ in 0..batch {
            fixture.frame_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }

        // Next silence batch starts from cycle position 0 again
        for _ in 0..batch * 2 {
            fixture.audio_tx.send(AudioChunk::silence()).unwrap();
        }
        fixture.feat_tx.send(feature_batch(batch)).unwrap();
        let pair = fixture
            .frame_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("frame pair");
        assert_eq!(pair.frame.pixel(0, 0), [0, 0, 0]);

        fixture.quit.store(true, Ordering::SeqCst);
        fixture.handle.join().unwrap();
    }
}
