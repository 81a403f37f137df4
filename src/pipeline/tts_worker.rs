//! TTS worker thread
//!
//! Drains the text queue, synthesizes each string through the TTS
//! collaborator, decodes the blob to 16 kHz mono PCM, and feeds the feature
//! extractor fixed 20 ms chunks. The first chunk of a string carries a
//! `start` marker; a zero-padded terminator chunk carries `end`. A failed
//! synthesis still emits the terminator so downstream stages keep moving.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::engine::tts::SpeechSynthesizer;
use crate::pipeline::decode::PcmDecoder;
use crate::pipeline::{AudioChunk, Marker, MarkerStatus, CHUNK_SAMPLES};

const TEXT_POLL: Duration = Duration::from_millis(500);

pub struct TtsWorker {
    pub avatar_id: String,
    pub text_rx: Receiver<String>,
    pub audio_tx: Sender<AudioChunk>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub decoder: Arc<dyn PcmDecoder>,
    pub quit: Arc<AtomicBool>,
    pub paused: Arc<AtomicBool>,
}

pub fn spawn(worker: TtsWorker) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("tts-{}", worker.avatar_id))
        .spawn(move || run(worker))
        .expect("spawn tts worker")
}

fn run(worker: TtsWorker) {
    // The synthesizer is async; give this thread its own small runtime
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(avatar_id = %worker.avatar_id, "TTS runtime build failed: {e}");
            return;
        }
    };

    tracing::info!(avatar_id = %worker.avatar_id, "TTS worker started");

    while !worker.quit.load(Ordering::SeqCst) {
        let text = match worker.text_rx.recv_timeout(TEXT_POLL) {
            Ok(text) => text,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let pcm = match runtime.block_on(worker.synthesizer.synthesize(&text, "")) {
            Ok(blob) => match worker.decoder.decode(&blob) {
                Ok(pcm) => pcm,
                Err(e) => {
                    tracing::error!(avatar_id = %worker.avatar_id, "TTS decode failed: {e}");
                    emit_terminator(&worker, &text);
                    continue;
                }
            },
            Err(e) => {
                tracing::error!(avatar_id = %worker.avatar_id, "TTS synthesis failed: {e}");
                emit_terminator(&worker, &text);
                continue;
            }
        };

        tracing::debug!(
            avatar_id = %worker.avatar_id,
            samples = pcm.len(),
            seconds = pcm.len() as f64 / 16_000.0,
            "TTS decoded"
        );

        if pcm.is_empty() {
            emit_terminator(&worker, &text);
            continue;
        }

        let mut first = true;
        let mut aborted = false;
        for window in pcm.chunks(CHUNK_SAMPLES) {
            if worker.paused.load(Ordering::SeqCst) || worker.quit.load(Ordering::SeqCst) {
                tracing::info!(avatar_id = %worker.avatar_id, "TTS interrupted");
                aborted = true;
                break;
            }

            let mut samples = window.to_vec();
            samples.resize(CHUNK_SAMPLES, 0.0); // zero-pad the tail chunk

            let marker = first.then(|| Marker {
                status: MarkerStatus::Start,
                text: text.clone(),
            });
            first = false;

            if worker.audio_tx.send(AudioChunk::voice(samples, marker)).is_err() {
                aborted = true;
                break;
            }
        }

        if !aborted {
            emit_terminator(&worker, &text);
        }
    }

    tracing::info!(avatar_id = %worker.avatar_id, "TTS worker stopped");
}

/// Zero-padded end-of-string terminator
fn emit_terminator(worker: &TtsWorker, text: &str) {
    let _ = worker.audio_tx.send(AudioChunk::voice(
        vec![0.0; CHUNK_SAMPLES],
        Some(Marker {
            status: MarkerStatus::End,
            text: text.to_string(),
        }),
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tts::MockSynthesizer;
    use crate::pipeline::decode::WavDecoder;
    use crossbeam_channel::unbounded;

    fn start_worker() -> (Sender<String>, Receiver<AudioChunk>, Arc<AtomicBool>, JoinHandle<()>) {
        let (text_tx, text_rx) = unbounded();
        let (audio_tx, audio_rx) = unbounded();
        let quit = Arc::new(AtomicBool::new(false));
        let handle = spawn(TtsWorker {
            avatar_id: "test".into(),
            text_rx,
            audio_tx,
            synthesizer: Arc::new(MockSynthesizer::new()),
            decoder: Arc::new(WavDecoder),
            quit: Arc::clone(&quit),
            paused: Arc::new(AtomicBool::new(false)),
        });
        (text_tx, audio_rx, quit, handle)
    }

    #[test]
    fn one_string_yields_start_chunks_and_terminator() {
        let (text_tx, audio_rx, quit, handle) = start_worker();
        text_tx.send("hello there".to_string()).unwrap();

        let mut chunks = Vec::new();
        loop {
            let chunk = audio_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("worker produced audio");
            let is_end = matches!(&chunk.marker, Some(m) if m.status == MarkerStatus::End);
            chunks.push(chunk);
            if is_end {
                break;
            }
        }

        // Mock TTS: 2 words * 200ms = 0.4s = 20 chunks, plus the terminator
        assert_eq!(chunks.len(), 21);
        assert!(matches!(&chunks[0].marker, Some(m) if m.status == MarkerStatus::Start));
        assert!(chunks[1..chunks.len() - 1].iter().all(|c| c.marker.is_none()));
        assert!(chunks.last().unwrap().samples.iter().all(|s| *s == 0.0));
        assert!(chunks.iter().all(|c| c.samples.len() == CHUNK_SAMPLES));

        quit.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn quit_is_observed_without_traffic() {
        let (_text_tx, _audio_rx, quit, handle) = start_worker();
        let start = std::time::Instant::now();
        quit.store(true, Ordering::SeqCst);
        handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
