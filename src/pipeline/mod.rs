// Streaming lip-sync pipeline
//
// One engine per avatar, retained for process life. Three worker threads
// connected by queues:
//
//   text -> TTS worker -> audio chunks (20ms) -> feature extractor
//        -> feature batches -> inference worker -> frame + audio pairs
//
// The feature queue is the backpressure point (capacity 2); the frame output
// queue (capacity 4 * batch) pushes that pressure back from a slow media
// consumer all the way to the extractor. Workers block on queues with short
// timeouts so the quit event is observed within about a second.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::avatar::model::{AudioFeatureExtractor, FeatureChunk, LipSyncModel, MockFeatureExtractor, MockLipSyncModel};
use crate::avatar::{AvatarManager, Frame};
use crate::config::Config;
use crate::engine::tts::SpeechSynthesizer;
use crate::error::GatewayError;

pub mod coupler;
pub mod decode;
mod features;
mod inference;
mod tts_worker;

use decode::{FfmpegDecoder, PcmDecoder, WavDecoder};

/// Audio chunk rate: 50 chunks/s = 20 ms per chunk
pub const AUDIO_FPS: usize = 50;

/// Samples per audio chunk at 16 kHz
pub const CHUNK_SAMPLES: usize = decode::SAMPLE_RATE as usize / AUDIO_FPS;

/// Sliding-window context, in chunks, on each side
pub const STRIDE_LEFT: usize = 4;
pub const STRIDE_RIGHT: usize = 4;

/// Feature-queue capacity: the pipeline's main backpressure point
pub const FEATURE_QUEUE_CAP: usize = 2;

/// Real frames the coupler accumulates before latching A/V sync
pub const PREBUFFER_FRAMES: usize = 3;

// ─────────────────────────────────────────────────────────────────────────────
// Chunk types
// ─────────────────────────────────────────────────────────────────────────────

/// Origin of an audio chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Produced by TTS (speech or its zero-padded terminator)
    Voice,
    /// Synthesized by the extractor when the input queue ran dry
    Silence,
}

/// Structured event marker riding on the first and last chunk of a string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerStatus {
    Start,
    End,
}

#[derive(Debug, Clone)]
pub struct Marker {
    pub status: MarkerStatus,
    pub text: String,
}

/// One 20 ms audio chunk flowing through the pipeline
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
    pub kind: ChunkKind,
    pub marker: Option<Marker>,
}

impl AudioChunk {
    pub fn silence() -> Self {
        Self {
            samples: vec![0.0; CHUNK_SAMPLES],
            kind: ChunkKind::Silence,
            marker: None,
        }
    }

    pub fn voice(samples: Vec<f32>, marker: Option<Marker>) -> Self {
        debug_assert_eq!(samples.len(), CHUNK_SAMPLES);
        Self {
            samples,
            kind: ChunkKind::Voice,
            marker,
        }
    }
}

/// One video frame paired with the two audio chunks it spans
#[derive(Debug, Clone)]
pub struct FramePair {
    pub frame: Frame,
    pub audio: Vec<AudioChunk>,
}

impl FramePair {
    /// Whether this pair carries the end-of-utterance marker
    pub fn is_end(&self) -> bool {
        self.audio
            .iter()
            .any(|c| matches!(&c.marker, Some(m) if m.status == MarkerStatus::End))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mirror indexing
// ─────────────────────────────────────────────────────────────────────────────

/// Map a monotonically increasing logical index onto a cycle of length `len`
/// by traversing it forward, then backward, then forward again. The avatar
/// keeps moving seamlessly however long the utterance runs.
pub fn mirror_index(len: usize, index: usize) -> usize {
    debug_assert!(len > 0);
    let turn = index / len;
    let pos = index % len;
    if turn % 2 == 0 {
        pos
    } else {
        len - pos - 1
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

/// Pipeline lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Assets loaded, threads not yet started
    Ready,
    /// Worker threads live
    Running,
    /// Threads joined; terminal
    Stopped,
}

/// Streaming lip-sync engine for one avatar
///
/// Immutable after setup: the avatar asset cycles and model handles.
/// Mutable: the queues and worker threads. Dropping the engine joins the
/// threads.
pub struct StreamingLipSync {
    pub avatar_id: String,
    batch_size: usize,

    text_tx: Sender<String>,
    text_rx: Receiver<String>,
    audio_in_rx: Receiver<AudioChunk>,
    audio_out_rx: Receiver<AudioChunk>,
    feat_rx: Receiver<Vec<FeatureChunk>>,
    frame_rx: Receiver<FramePair>,

    quit: Arc<AtomicBool>,
    render: Arc<AtomicBool>,
    tts_paused: Arc<AtomicBool>,
    flush_epoch: Arc<AtomicU64>,

    state: Mutex<PipelineState>,
    workers: Mutex<Vec<JoinHandle<()>>>,

    spawn: Mutex<Option<WorkerSpawn>>,
}

/// Everything the worker threads need, parked between setup() and start()
struct WorkerSpawn {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    decoder: Arc<dyn PcmDecoder>,
    extractor: Arc<dyn AudioFeatureExtractor>,
    model: Arc<dyn LipSyncModel>,
    assets: Arc<crate::avatar::AvatarAssets>,
    audio_in_tx: Sender<AudioChunk>,
    audio_out_tx: Sender<AudioChunk>,
    feat_tx: Sender<Vec<FeatureChunk>>,
    frame_tx: Sender<FramePair>,
}

impl StreamingLipSync {
    /// Load nothing, wire everything: the caller has already loaded the
    /// avatar assets (a load failure keeps the pipeline from ever reaching
    /// Ready and surfaces as upstream-failure).
    #[allow(clippy::too_many_arguments)]
    pub fn setup(
        avatar_id: &str,
        assets: Arc<crate::avatar::AvatarAssets>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        decoder: Arc<dyn PcmDecoder>,
        extractor: Arc<dyn AudioFeatureExtractor>,
        model: Arc<dyn LipSyncModel>,
        batch_size: usize,
    ) -> Self {
        let (text_tx, text_rx) = unbounded();
        let (audio_in_tx, audio_in_rx) = unbounded();
        let (audio_out_tx, audio_out_rx) = unbounded();
        let (feat_tx, feat_rx) = bounded(FEATURE_QUEUE_CAP);
        let (frame_tx, frame_rx) = bounded(batch_size * 4);

        tracing::info!(avatar_id, batch_size, "Lip-sync engine set up");

        Self {
            avatar_id: avatar_id.to_string(),
            batch_size,
            text_tx,
            text_rx,
            audio_in_rx,
            audio_out_rx,
            feat_rx,
            frame_rx,
            quit: Arc::new(AtomicBool::new(false)),
            render: Arc::new(AtomicBool::new(false)),
            tts_paused: Arc::new(AtomicBool::new(false)),
            flush_epoch: Arc::new(AtomicU64::new(0)),
            state: Mutex::new(PipelineState::Ready),
            workers: Mutex::new(Vec::new()),
            spawn: Mutex::new(Some(WorkerSpawn {
                synthesizer,
                decoder,
                extractor,
                model,
                assets,
                audio_in_tx,
                audio_out_tx,
                feat_tx,
                frame_tx,
            })),
        }
    }

    /// Start the three worker threads. Idempotent: a running engine stays
    /// running.
    pub fn start(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != PipelineState::Ready {
            return;
        }

        let spawn = match self.spawn.lock().unwrap_or_else(|e| e.into_inner()).take() {
            Some(s) => s,
            None => return,
        };

        self.quit.store(false, Ordering::SeqCst);
        self.render.store(true, Ordering::SeqCst);

        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());

        workers.push(tts_worker::spawn(tts_worker::TtsWorker {
            avatar_id: self.avatar_id.clone(),
            text_rx: self.text_rx.clone(),
            audio_tx: spawn.audio_in_tx,
            synthesizer: spawn.synthesizer,
            decoder: spawn.decoder,
            quit: Arc::clone(&self.quit),
            paused: Arc::clone(&self.tts_paused),
        }));

        workers.push(features::spawn(features::FeatureWorker {
            avatar_id: self.avatar_id.clone(),
            batch_size: self.batch_size,
            audio_in_rx: self.audio_in_rx.clone(),
            audio_out_tx: spawn.audio_out_tx,
            feat_tx: spawn.feat_tx,
            frame_rx: self.frame_rx.clone(),
            extractor: spawn.extractor,
            quit: Arc::clone(&self.quit),
            flush_epoch: Arc::clone(&self.flush_epoch),
        }));

        workers.push(inference::spawn(inference::InferenceWorker {
            avatar_id: self.avatar_id.clone(),
            batch_size: self.batch_size,
            feat_rx: self.feat_rx.clone(),
            audio_out_rx: self.audio_out_rx.clone(),
            frame_tx: spawn.frame_tx,
            assets: spawn.assets,
            model: spawn.model,
            quit: Arc::clone(&self.quit),
            render: Arc::clone(&self.render),
        }));

        *state = PipelineState::Running;
        tracing::info!(avatar_id = %self.avatar_id, "Lip-sync engine started");
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue one string for synthesis and rendering
    pub fn speak(&self, text: &str) {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }
        let _ = self.text_tx.send(trimmed.to_string());
    }

    /// Receiver handle for the frame+audio output (one consumer per request)
    pub fn frames(&self) -> Receiver<FramePair> {
        self.frame_rx.clone()
    }

    /// Mid-request interrupt: drain every queue and the extractor window,
    /// abandon the string being synthesized, keep the threads alive.
    pub fn flush(&self) {
        self.tts_paused.store(true, Ordering::SeqCst);

        while self.text_rx.try_recv().is_ok() {}
        while self.audio_in_rx.try_recv().is_ok() {}
        while self.audio_out_rx.try_recv().is_ok() {}
        while self.feat_rx.try_recv().is_ok() {}
        while self.frame_rx.try_recv().is_ok() {}
        self.flush_epoch.fetch_add(1, Ordering::SeqCst);

        self.tts_paused.store(false, Ordering::SeqCst);
        tracing::debug!(avatar_id = %self.avatar_id, "Pipeline flushed");
    }

    /// Teardown: stop rendering, signal quit, join every worker
    pub fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != PipelineState::Running {
                *state = PipelineState::Stopped;
                return;
            }
            *state = PipelineState::Stopped;
        }

        self.render.store(false, Ordering::SeqCst);
        self.quit.store(true, Ordering::SeqCst);

        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                tracing::warn!(avatar_id = %self.avatar_id, "Pipeline worker panicked");
            }
        }
        self.flush();
        tracing::info!(avatar_id = %self.avatar_id, "Lip-sync engine stopped");
    }
}

impl Drop for StreamingLipSync {
    fn drop(&mut self) {
        self.stop();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-avatar engine cache
// ─────────────────────────────────────────────────────────────────────────────

/// Lazily-created, process-retained lip-sync engines keyed by avatar id
pub struct LipSyncEngines {
    engines: Mutex<HashMap<String, Arc<StreamingLipSync>>>,
    config: Arc<Config>,
    manager: Arc<AvatarManager>,
    extractor: Arc<dyn AudioFeatureExtractor>,
    model: Arc<dyn LipSyncModel>,
}

impl LipSyncEngines {
    pub fn new(config: Arc<Config>, manager: Arc<AvatarManager>) -> Self {
        // The neural collaborators are external models; the deterministic
        // in-process variants stand in until a served model is wired to the
        // same traits.
        let extractor: Arc<dyn AudioFeatureExtractor> = Arc::new(MockFeatureExtractor);
        let model: Arc<dyn LipSyncModel> = Arc::new(MockLipSyncModel);
        Self {
            engines: Mutex::new(HashMap::new()),
            config,
            manager,
            extractor,
            model,
        }
    }

    /// Engine for an avatar, setting it up and starting it on first use.
    /// Asset or model load failure means the engine never reaches Ready and
    /// the error propagates to the caller.
    pub fn get_or_create(
        &self,
        avatar_id: &str,
        synthesizer: Arc<dyn SpeechSynthesizer>,
    ) -> Result<Arc<StreamingLipSync>, GatewayError> {
        let mut engines = self.engines.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(engine) = engines.get(avatar_id) {
            return Ok(Arc::clone(engine));
        }

        let assets = self.manager.assets(avatar_id, self.model.as_ref())?;

        let decoder: Arc<dyn PcmDecoder> =
            if self.config.features.tts && self.config.tts.service_url.is_some() {
                Arc::new(FfmpegDecoder::new(self.config.avatar.ffmpeg_path.clone()))
            } else {
                // Mock synthesizer emits 16 kHz mono WAV; decode in place
                Arc::new(WavDecoder)
            };

        let engine = Arc::new(StreamingLipSync::setup(
            avatar_id,
            assets,
            synthesizer,
            decoder,
            Arc::clone(&self.extractor),
            Arc::clone(&self.model),
            self.config.avatar.batch_size,
        ));
        engine.start();

        engines.insert(avatar_id.to_string(), Arc::clone(&engine));
        tracing::info!(avatar_id, "Created streaming engine");
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avatar::model::MockLipSyncModel;
    use crate::avatar::{AvatarAssets, BoundingBox};
    use crate::engine::tts::MockSynthesizer;
    use crate::pipeline::decode::WavDecoder;
    use std::time::Duration;

    fn test_assets(cycle_len: usize) -> Arc<AvatarAssets> {
        Arc::new(AvatarAssets {
            avatar_id: "test".into(),
            frames: (0..cycle_len)
                .map(|i| Frame::solid(32, 32, [i as u8, 0, 0]))
                .collect(),
            masks: (0..cycle_len)
                .map(|_| Frame::solid(32, 32, [255, 255, 255]))
                .collect(),
            coords: (0..cycle_len).map(|_| BoundingBox::new(8, 8, 24, 24)).collect(),
            mask_coords: (0..cycle_len).map(|_| BoundingBox::new(8, 8, 24, 24)).collect(),
            latents: MockLipSyncModel
                .load_latents(std::path::Path::new("unused"), cycle_len)
                .unwrap(),
        })
    }

    fn test_engine() -> StreamingLipSync {
        StreamingLipSync::setup(
            "avatar_test",
            test_assets(8),
            Arc::new(MockSynthesizer::new()),
            Arc::new(WavDecoder),
            Arc::new(MockFeatureExtractor),
            Arc::new(MockLipSyncModel),
            2,
        )
    }

    #[test]
    fn lifecycle_ready_running_stopped() {
        let engine = test_engine();
        assert_eq!(engine.state(), PipelineState::Ready);

        engine.start();
        assert_eq!(engine.state(), PipelineState::Running);
        // start is idempotent
        engine.start();
        assert_eq!(engine.state(), PipelineState::Running);

        engine.stop();
        assert_eq!(engine.state(), PipelineState::Stopped);
    }

    #[test]
    fn spoken_text_flows_through_to_frame_pairs() {
        let engine = test_engine();
        engine.start();
        let frames = engine.frames();

        engine.speak("hello world");

        let mut count = 0usize;
        let mut ended = false;
        while let Ok(pair) = frames.recv_timeout(Duration::from_secs(10)) {
            assert_eq!(pair.audio.len(), 2);
            count += 1;
            if pair.is_end() {
                ended = true;
                break;
            }
            if count > 500 {
                break;
            }
        }

        assert!(ended, "end marker must reach the output");
        assert!(count > 0);
        engine.stop();
    }

    #[test]
    fn flush_keeps_the_engine_running() {
        let engine = test_engine();
        engine.start();

        engine.speak("first utterance that will be interrupted.");
        std::thread::sleep(Duration::from_millis(100));
        engine.flush();
        assert_eq!(engine.state(), PipelineState::Running);

        engine.stop();
    }

    #[test]
    fn mirror_index_walks_forward_then_back() {
        let len = 4;
        let walk: Vec<usize> = (0..10).map(|i| mirror_index(len, i)).collect();
        assert_eq!(walk, vec![0, 1, 2, 3, 3, 2, 1, 0, 0, 1]);
    }

    #[test]
    fn mirror_index_is_a_bijection_per_window() {
        for len in [1usize, 2, 5, 8, 25] {
            for turn in 0..4 {
                let mut seen = vec![false; len];
                for i in 0..len {
                    let pos = mirror_index(len, turn * len + i);
                    assert!(pos < len);
                    assert!(!seen[pos], "duplicate position in window");
                    seen[pos] = true;
                }
                assert!(seen.iter().all(|s| *s));
            }
        }
    }

    #[test]
    fn mirror_index_is_self_inverse_within_a_turn() {
        // Applying the window mapping twice with the same parity returns the
        // original index
        for len in [3usize, 7, 25] {
            for parity in 0..2 {
                for i in 0..len {
                    let once = mirror_index(len, parity * len + i);
                    let twice = mirror_index(len, parity * len + once);
                    assert_eq!(twice, i);
                }
            }
        }
    }

    #[test]
    fn end_marker_detection_on_frame_pairs() {
        let pair = FramePair {
            frame: Frame::solid(2, 2, [0, 0, 0]),
            audio: vec![
                AudioChunk::silence(),
                AudioChunk::voice(
                    vec![0.0; CHUNK_SAMPLES],
                    Some(Marker {
                        status: MarkerStatus::End,
                        text: "done".into(),
                    }),
                ),
            ],
        };
        assert!(pair.is_end());

        let pair = FramePair {
            frame: Frame::solid(2, 2, [0, 0, 0]),
            audio: vec![AudioChunk::silence(), AudioChunk::silence()],
        };
        assert!(!pair.is_end());
    }
}
