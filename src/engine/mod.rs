// Per-tutor engine bundle and cache
//
// Every tutor is served by its own Engine holding the LLM / ASR / TTS / RAG
// handles plus the shared avatar manager. Engines are created lazily on
// first use and retained for the life of the process; concurrent acquires
// for the same tutor observe the same instance (double-checked creation).
//
// Isolation rationale: tutors may be configured with different LLM weights
// via TUTOR_{id}_LLM_MODEL. A shared engine would cross-contaminate that
// configuration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;

use crate::avatar::AvatarManager;
use crate::config::Config;
use crate::error::GatewayError;

pub mod asr;
pub mod llm;
pub mod rag;
pub mod tts;

use asr::{MockRecognizer, SpeechRecognizer, WhisperService};
use llm::{LanguageModel, MockModel, OllamaModel, TokenStream};
use rag::{KnowledgeRetriever, MockRetriever, RagService};
use tts::{EdgeTtsService, MockSynthesizer, SpeechSynthesizer};

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

/// Collaborator bundle for one tutor
pub struct Engine {
    pub tutor_id: i64,
    llm: Arc<dyn LanguageModel>,
    asr: Arc<dyn SpeechRecognizer>,
    tts: Arc<dyn SpeechSynthesizer>,
    rag: Arc<dyn KnowledgeRetriever>,
    /// Shared avatar asset manager (idle frames, lip-sync engines)
    pub avatars: Arc<AvatarManager>,
    asr_language: String,
}

impl Engine {
    fn new(config: &Config, http: reqwest::Client, avatars: Arc<AvatarManager>, tutor_id: i64) -> Self {
        let llm: Arc<dyn LanguageModel> = if config.features.llm {
            Arc::new(OllamaModel::new(http.clone(), &config.llm, tutor_id))
        } else {
            Arc::new(MockModel::new(tutor_id))
        };

        let asr: Arc<dyn SpeechRecognizer> = match (&config.asr.service_url, config.features.asr) {
            (Some(url), true) => Arc::new(WhisperService::new(http.clone(), &config.asr, url.clone())),
            (None, true) => {
                tracing::warn!("ASR enabled but ASR_SERVICE_URL unset, falling back to mock");
                Arc::new(MockRecognizer::new())
            }
            _ => Arc::new(MockRecognizer::new()),
        };

        let tts: Arc<dyn SpeechSynthesizer> = match (&config.tts.service_url, config.features.tts) {
            (Some(url), true) => Arc::new(EdgeTtsService::new(http.clone(), &config.tts, url.clone())),
            (None, true) => {
                tracing::warn!("TTS enabled but TTS_SERVICE_URL unset, falling back to mock");
                Arc::new(MockSynthesizer::new())
            }
            _ => Arc::new(MockSynthesizer::new()),
        };

        let rag: Arc<dyn KnowledgeRetriever> = match (&config.rag.url, config.features.rag) {
            (Some(url), true) => Arc::new(RagService::new(http, &config.rag, url.clone())),
            (None, true) => {
                tracing::warn!("RAG enabled but RAG_URL unset, falling back to mock");
                Arc::new(MockRetriever::new())
            }
            _ => Arc::new(MockRetriever::new()),
        };

        tracing::info!(tutor_id, "Engine initialized");

        Self {
            tutor_id,
            llm,
            asr,
            tts,
            rag,
            avatars,
            asr_language: config.asr.language.clone(),
        }
    }

    /// Retrieve knowledge-base context for a query, swallowing retrieval
    /// failures (generation proceeds contextless, as the failure contract
    /// requires)
    async fn context_for(&self, text: &str, kb_id: Option<&str>) -> Option<String> {
        let kb_id = kb_id?;
        match self.rag.retrieve(text, kb_id).await {
            Ok(chunks) if !chunks.is_empty() => {
                tracing::debug!(kb_id, count = chunks.len(), "RAG context retrieved");
                Some(rag::format_context(&chunks))
            }
            Ok(_) => None,
            Err(e) => {
                tracing::error!(kb_id, "RAG retrieval failed: {e}, using direct LLM");
                None
            }
        }
    }

    /// Full text turn: optional retrieval, then generation
    pub async fn respond_text(
        &self,
        text: &str,
        kb_id: Option<&str>,
    ) -> Result<String, GatewayError> {
        let context = self.context_for(text, kb_id).await;
        self.llm.generate(text, context.as_deref()).await
    }

    /// Streaming text turn for the realtime pipeline
    pub async fn stream_response(
        &self,
        text: &str,
        kb_id: Option<&str>,
    ) -> Result<TokenStream, GatewayError> {
        let context = self.context_for(text, kb_id).await;
        self.llm.stream_generate(text, context.as_deref()).await
    }

    /// Transcribe an encoded utterance
    pub async fn transcribe(&self, audio: &[u8]) -> Result<String, GatewayError> {
        self.asr.transcribe(audio, &self.asr_language).await
    }

    /// Synthesize speech for a reply
    pub async fn synthesize(&self, text: &str) -> Result<Bytes, GatewayError> {
        self.tts.synthesize(text, &self.asr_language).await
    }

    /// Synthesizer handle for the lip-sync pipeline's TTS worker
    pub fn synthesizer(&self) -> Arc<dyn SpeechSynthesizer> {
        Arc::clone(&self.tts)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cache
// ─────────────────────────────────────────────────────────────────────────────

/// Lazily-populated map of tutor_id -> Engine
pub struct EngineCache {
    engines: RwLock<HashMap<i64, Arc<Engine>>>,
    /// Serializes the create path; readers never take it
    create_lock: Mutex<()>,
    config: Arc<Config>,
    http: reqwest::Client,
    avatars: Arc<AvatarManager>,
}

impl EngineCache {
    pub fn new(config: Arc<Config>, http: reqwest::Client, avatars: Arc<AvatarManager>) -> Self {
        Self {
            engines: RwLock::new(HashMap::new()),
            create_lock: Mutex::new(()),
            config,
            http,
            avatars,
        }
    }

    /// Get the engine for a tutor, creating it on first use.
    ///
    /// Fast path is a shared read; the create path is serialized and
    /// re-checks under the lock so concurrent first requests for the same
    /// tutor yield one instance.
    pub fn acquire(&self, tutor_id: i64) -> Arc<Engine> {
        if let Some(engine) = self
            .engines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&tutor_id)
        {
            return Arc::clone(engine);
        }

        let _guard = self.create_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(engine) = self
            .engines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&tutor_id)
        {
            return Arc::clone(engine);
        }

        let engine = Arc::new(Engine::new(
            &self.config,
            self.http.clone(),
            Arc::clone(&self.avatars),
            tutor_id,
        ));
        self.engines
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tutor_id, Arc::clone(&engine));
        tracing::info!(tutor_id, "Created engine instance");
        engine
    }

    /// Drop a tutor's engine. For hot-reload, not normal operation; the
    /// caller is responsible for having no outstanding uses.
    pub fn release(&self, tutor_id: i64) -> bool {
        let removed = self
            .engines
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&tutor_id)
            .is_some();
        if removed {
            tracing::info!(tutor_id, "Released engine instance");
        }
        removed
    }

    /// Tutor ids with a live engine
    pub fn list(&self) -> Vec<i64> {
        self.engines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> EngineCache {
        let config = Arc::new(Config {
            features: crate::config::Features {
                llm: false,
                asr: false,
                tts: false,
                rag: false,
                avatar: false,
            },
            ..Config::default()
        });
        let avatars = Arc::new(AvatarManager::new(&config.avatar));
        EngineCache::new(config, reqwest::Client::new(), avatars)
    }

    #[test]
    fn acquire_returns_the_same_instance() {
        let cache = cache();
        let a = cache.acquire(7);
        let b = cache.acquire(7);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.list(), vec![7]);
    }

    #[test]
    fn concurrent_acquire_yields_one_engine() {
        let cache = Arc::new(cache());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || cache.acquire(13)));
        }
        let engines: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for pair in engines.windows(2) {
            assert!(Arc::ptr_eq(&pair[0], &pair[1]));
        }
        assert_eq!(cache.list(), vec![13]);
    }

    #[test]
    fn release_then_acquire_recreates() {
        let cache = cache();
        let first = cache.acquire(5);
        assert!(cache.release(5));
        assert!(!cache.release(5));
        let second = cache.acquire(5);
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn mock_engine_round_trip() {
        let cache = cache();
        let engine = cache.acquire(9);

        let reply = engine.respond_text("hello", None).await.unwrap();
        assert!(reply.contains("tutor 9"));

        let transcript = engine.transcribe(&[0u8; 8]).await.unwrap();
        assert!(transcript.contains("8 bytes"));

        let audio = engine.synthesize(&reply).await.unwrap();
        assert_eq!(&audio[..4], b"RIFF");
    }
}
