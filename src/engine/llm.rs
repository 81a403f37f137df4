//! LLM collaborator: Ollama-compatible chat client and deterministic mock
//!
//! Each tutor's engine holds its own `LanguageModel` handle because tutors
//! may be configured with different model weights (`TUTOR_{id}_LLM_MODEL`).

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::GatewayError;

/// A finite lazy sequence of generated tokens
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, GatewayError>> + Send>>;

/// Text-generation capability consumed by the message router
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generate a complete reply for one user turn
    async fn generate(&self, text: &str, context: Option<&str>) -> Result<String, GatewayError>;

    /// Generate a reply as a token stream (realtime pipeline feed)
    async fn stream_generate(
        &self,
        text: &str,
        context: Option<&str>,
    ) -> Result<TokenStream, GatewayError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Ollama client
// ─────────────────────────────────────────────────────────────────────────────

const SYSTEM_PROMPT: &str =
    "You are a professional virtual tutor. Answer the student's questions in a \
     friendly and accurate way.";

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f64,
}

#[derive(Deserialize)]
struct ChatChunk {
    message: ChatChunkMessage,
    #[serde(default)]
    done: bool,
}

#[derive(Deserialize)]
struct ChatChunkMessage {
    #[serde(default)]
    content: String,
}

/// Ollama-backed language model for one tutor
pub struct OllamaModel {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f64,
}

impl OllamaModel {
    pub fn new(client: reqwest::Client, config: &LlmConfig, tutor_id: i64) -> Self {
        let model = config.model_for_tutor(tutor_id);
        tracing::info!(tutor_id, model = %model, "LLM engine initialized");
        Self {
            client,
            base_url: config.base_url.clone(),
            model,
            temperature: config.temperature,
        }
    }

    fn request(&self, text: &str, context: Option<&str>, stream: bool) -> ChatRequest<'_> {
        let user_content = match context {
            // Retrieved knowledge-base context rides ahead of the question
            Some(ctx) if !ctx.is_empty() => {
                format!("Use the following reference material when relevant:\n{ctx}\n\nQuestion: {text}")
            }
            _ => text.to_string(),
        };
        ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user_content,
                },
            ],
            stream,
            options: ChatOptions {
                temperature: self.temperature,
            },
        }
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl LanguageModel for OllamaModel {
    async fn generate(&self, text: &str, context: Option<&str>) -> Result<String, GatewayError> {
        let response = self
            .client
            .post(self.chat_url())
            .json(&self.request(text, context, false))
            .send()
            .await
            .map_err(|e| GatewayError::Upstream(format!("llm request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(GatewayError::Upstream(format!(
                "llm returned status {}",
                response.status()
            )));
        }

        let chunk: ChatChunk = response
            .json()
            .await
            .map_err(|e| GatewayError::Upstream(format!("llm response decode failed: {e}")))?;
        Ok(chunk.message.content)
    }

    async fn stream_generate(
        &self,
        text: &str,
        context: Option<&str>,
    ) -> Result<TokenStream, GatewayError> {
        use futures::StreamExt;

        let response = self
            .client
            .post(self.chat_url())
            .json(&self.request(text, context, true))
            .send()
            .await
            .map_err(|e| GatewayError::Upstream(format!("llm request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(GatewayError::Upstream(format!(
                "llm returned status {}",
                response.status()
            )));
        }

        // The chat endpoint streams newline-delimited JSON chunks; chunk
        // boundaries do not align with line boundaries, so buffer and split.
        let body = response.bytes_stream();
        let tokens = futures::stream::unfold(
            (body, Vec::<u8>::new(), false),
            |(mut body, mut buf, mut done)| async move {
                loop {
                    if done {
                        return None;
                    }
                    if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = buf.drain(..=pos).collect();
                        let line = String::from_utf8_lossy(&line);
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        return match serde_json::from_str::<ChatChunk>(line) {
                            Ok(chunk) => {
                                if chunk.done {
                                    done = true;
                                    if chunk.message.content.is_empty() {
                                        None
                                    } else {
                                        Some((Ok(chunk.message.content), (body, buf, done)))
                                    }
                                } else {
                                    Some((Ok(chunk.message.content), (body, buf, done)))
                                }
                            }
                            Err(e) => Some((
                                Err(GatewayError::Upstream(format!(
                                    "llm stream decode failed: {e}"
                                ))),
                                (body, buf, true),
                            )),
                        };
                    }
                    match body.next().await {
                        Some(Ok(bytes)) => buf.extend_from_slice(&bytes),
                        Some(Err(e)) => {
                            return Some((
                                Err(GatewayError::Upstream(format!("llm stream failed: {e}"))),
                                (body, buf, true),
                            ))
                        }
                        None => return None,
                    }
                }
            },
        );

        Ok(Box::pin(tokens))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mock
// ─────────────────────────────────────────────────────────────────────────────

/// Deterministic stand-in used when the LLM gate is off or the real model
/// fails to initialize
pub struct MockModel {
    tutor_id: i64,
}

impl MockModel {
    pub fn new(tutor_id: i64) -> Self {
        tracing::info!(tutor_id, "LLM engine initialized (mock mode)");
        Self { tutor_id }
    }
}

#[async_trait]
impl LanguageModel for MockModel {
    async fn generate(&self, text: &str, _context: Option<&str>) -> Result<String, GatewayError> {
        Ok(format!(
            "[Mock LLM - tutor {}] You said: \"{}\". This is a scripted reply; \
             a real deployment would answer through the configured model.",
            self.tutor_id, text
        ))
    }

    async fn stream_generate(
        &self,
        text: &str,
        context: Option<&str>,
    ) -> Result<TokenStream, GatewayError> {
        let full = self.generate(text, context).await?;
        let words: Vec<Result<String, GatewayError>> = full
            .split_inclusive(' ')
            .map(|w| Ok(w.to_string()))
            .collect();
        Ok(Box::pin(futures::stream::iter(words)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn mock_reply_echoes_input() {
        let model = MockModel::new(9);
        let reply = model.generate("hello", None).await.unwrap();
        assert!(reply.contains("tutor 9"));
        assert!(reply.contains("hello"));
    }

    #[tokio::test]
    async fn mock_stream_reassembles_to_full_reply() {
        let model = MockModel::new(3);
        let full = model.generate("hi", None).await.unwrap();

        let mut stream = model.stream_generate("hi", None).await.unwrap();
        let mut assembled = String::new();
        while let Some(token) = stream.next().await {
            assembled.push_str(&token.unwrap());
        }
        assert_eq!(assembled, full);
    }
}
