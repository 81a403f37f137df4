//! Audio-feature extraction worker
//!
//! Sliding window over the 20 ms chunk stream with fixed left/right context.
//! Every chunk drained from the input queue is also forwarded to the audio
//! output queue so the playback timeline can be reconstructed next to the
//! frames the features will produce. When the input queue runs dry the gap
//! is filled with typed silence, so the pipeline idles instead of stalling.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender};

use crate::avatar::model::{AudioFeatureExtractor, FeatureChunk};
use crate::pipeline::{AudioChunk, FramePair, STRIDE_LEFT, STRIDE_RIGHT};

/// How long to wait for a real chunk before substituting silence
const CHUNK_POLL: Duration = Duration::from_millis(10);

/// Retry interval for the bounded feature queue; keeps quit observable
const FEAT_PUSH_POLL: Duration = Duration::from_millis(100);

pub struct FeatureWorker {
    pub avatar_id: String,
    pub batch_size: usize,
    pub audio_in_rx: Receiver<AudioChunk>,
    pub audio_out_tx: Sender<AudioChunk>,
    pub feat_tx: Sender<Vec<FeatureChunk>>,
    /// Output-frame queue handle, observed for depth only
    pub frame_rx: Receiver<FramePair>,
    pub extractor: Arc<dyn AudioFeatureExtractor>,
    pub quit: Arc<AtomicBool>,
    pub flush_epoch: Arc<AtomicU64>,
}

pub fn spawn(worker: FeatureWorker) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("features-{}", worker.avatar_id))
        .spawn(move || run(worker))
        .expect("spawn feature worker")
}

fn run(worker: FeatureWorker) {
    tracing::info!(avatar_id = %worker.avatar_id, "Feature extractor started");

    let mut window: Vec<AudioChunk> = Vec::new();
    warm_up(&worker, &mut window);

    let mut epoch = worker.flush_epoch.load(Ordering::SeqCst);

    while !worker.quit.load(Ordering::SeqCst) {
        let current_epoch = worker.flush_epoch.load(Ordering::SeqCst);
        if current_epoch != epoch {
            epoch = current_epoch;
            window.clear();
        }

        run_step(&worker, &mut window);

        // The frame queue bounds inference; when it backs up far enough,
        // stop pouring more work in ahead of it
        if worker.frame_rx.len() >= worker.batch_size * 2 {
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    tracing::info!(avatar_id = %worker.avatar_id, "Feature extractor stopped");
}

/// Next chunk from the TTS side, or typed silence on timeout
fn next_chunk(worker: &FeatureWorker) -> AudioChunk {
    worker
        .audio_in_rx
        .recv_timeout(CHUNK_POLL)
        .unwrap_or_else(|_| AudioChunk::silence())
}

/// Fill the initial context window. The left-context chunks exist only for
/// feature extraction, so they are not forwarded to the audio output.
fn warm_up(worker: &FeatureWorker, window: &mut Vec<AudioChunk>) {
    for i in 0..STRIDE_LEFT + STRIDE_RIGHT {
        let chunk = next_chunk(worker);
        window.push(chunk.clone());
        if i >= STRIDE_LEFT {
            let _ = worker.audio_out_tx.send(chunk);
        }
    }
}

fn run_step(worker: &FeatureWorker, window: &mut Vec<AudioChunk>) {
    // Drain two chunks per eventual video frame
    for _ in 0..worker.batch_size * 2 {
        let chunk = next_chunk(worker);
        window.push(chunk.clone());
        let _ = worker.audio_out_tx.send(chunk);
    }

    if window.len() <= STRIDE_LEFT + STRIDE_RIGHT {
        return;
    }

    let pcm: Vec<f32> = window.iter().flat_map(|c| c.samples.iter().copied()).collect();

    let features = match worker.extractor.audio2feat(&pcm) {
        Ok(features) => features,
        Err(e) => {
            // Skip this step; next chunks get a fresh attempt
            tracing::error!(avatar_id = %worker.avatar_id, "Feature extraction failed: {e}");
            retain_context(window);
            return;
        }
    };

    let chunks = worker.extractor.feature2chunks(
        &features,
        crate::avatar::VIDEO_FPS as f64,
        worker.batch_size,
        STRIDE_LEFT as f64 / 2.0,
    );

    // Bounded push: this is the pipeline's main backpressure point
    let mut pending = chunks;
    loop {
        match worker.feat_tx.send_timeout(pending, FEAT_PUSH_POLL) {
            Ok(()) => break,
            Err(SendTimeoutError::Timeout(back)) => {
                if worker.quit.load(Ordering::SeqCst) {
                    return;
                }
                pending = back;
            }
            Err(SendTimeoutError::Disconnected(_)) => return,
        }
    }

    retain_context(window);
}

/// Keep only the context tail for the next step
fn retain_context(window: &mut Vec<AudioChunk>) {
    let keep = STRIDE_LEFT + STRIDE_RIGHT;
    if window.len() > keep {
        window.drain(..window.len() - keep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avatar::model::MockFeatureExtractor;
    use crate::pipeline::{ChunkKind, CHUNK_SAMPLES, FEATURE_QUEUE_CAP};
    use crossbeam_channel::{bounded, unbounded};

    struct Fixture {
        audio_in_tx: Sender<AudioChunk>,
        audio_out_rx: Receiver<AudioChunk>,
        feat_rx: Receiver<Vec<FeatureChunk>>,
        quit: Arc<AtomicBool>,
        handle: JoinHandle<()>,
    }

    fn start(batch_size: usize) -> Fixture {
        let (audio_in_tx, audio_in_rx) = unbounded();
        let (audio_out_tx, audio_out_rx) = unbounded();
        let (feat_tx, feat_rx) = bounded(FEATURE_QUEUE_CAP);
        let (_frame_tx, frame_rx) = bounded::<FramePair>(batch_size * 4);
        let quit = Arc::new(AtomicBool::new(false));
        let handle = spawn(FeatureWorker {
            avatar_id: "test".into(),
            batch_size,
            audio_in_rx,
            audio_out_tx,
            feat_tx,
            frame_rx,
            extractor: Arc::new(MockFeatureExtractor),
            quit: Arc::clone(&quit),
            flush_epoch: Arc::new(AtomicU64::new(0)),
        });
        Fixture {
            audio_in_tx,
            audio_out_rx,
            feat_rx,
            quit,
            handle,
        }
    }

    #[test]
    fn voice_chunks_produce_batches_and_mirrored_audio() {
        let fixture = start(4);

        // Feed plenty of voiced chunks
        for _ in 0..64 {
            fixture
                .audio_in_tx
                .send(AudioChunk::voice(vec![0.3; CHUNK_SAMPLES], None))
                .unwrap();
        }

        let batch = fixture
            .feat_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("feature batch");
        assert_eq!(batch.len(), 4);

        // Audio chunks were forwarded for playback reconstruction
        let forwarded = fixture
            .audio_out_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("forwarded audio");
        assert_eq!(forwarded.samples.len(), CHUNK_SAMPLES);

        fixture.quit.store(true, Ordering::SeqCst);
        fixture.handle.join().unwrap();
    }

    #[test]
    fn dry_input_yields_typed_silence_not_a_stall() {
        let fixture = start(2);

        // No input at all: the worker must keep producing, typed as silence
        let batch = fixture
            .feat_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("silence batch");
        assert_eq!(batch.len(), 2);

        let forwarded = fixture
            .audio_out_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("forwarded silence");
        assert_eq!(forwarded.kind, ChunkKind::Silence);

        fixture.quit.store(true, Ordering::SeqCst);
        fixture.handle.join().unwrap();
    }

    #[test]
    fn full_feature_queue_blocks_but_quit_still_lands() {
        let fixture = start(2);

        // Never consume features: the bounded queue fills to capacity and
        // the worker parks on the push instead of spinning
        std::thread::sleep(Duration::from_millis(600));
        assert!(fixture.feat_rx.len() <= FEATURE_QUEUE_CAP);

        let start = std::time::Instant::now();
        fixture.quit.store(true, Ordering::SeqCst);
        fixture.handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
