//! RAG collaborator: knowledge-base retrieval client and mock

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::RagConfig;
use crate::error::GatewayError;

/// One retrieved knowledge-base chunk
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievedChunk {
    pub content: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub source: Option<String>,
}

/// Knowledge-base retrieval capability
#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    /// Retrieve the chunks most relevant to a query from one knowledge base
    async fn retrieve(&self, query: &str, kb_id: &str)
        -> Result<Vec<RetrievedChunk>, GatewayError>;
}

/// Render retrieved chunks as an LLM context block
pub fn format_context(chunks: &[RetrievedChunk]) -> String {
    chunks
        .iter()
        .enumerate()
        .map(|(i, c)| format!("[{}] {}", i + 1, c.content.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Client for a standalone retrieval service
pub struct RagService {
    client: reqwest::Client,
    url: String,
    top_k: usize,
}

#[derive(Deserialize)]
struct RetrieveResponse {
    #[serde(default)]
    chunks: Vec<RetrievedChunk>,
}

impl RagService {
    pub fn new(client: reqwest::Client, config: &RagConfig, url: String) -> Self {
        tracing::info!(top_k = config.top_k, url = %url, "RAG engine initialized");
        Self {
            client,
            url,
            top_k: config.top_k,
        }
    }
}

#[async_trait]
impl KnowledgeRetriever for RagService {
    async fn retrieve(
        &self,
        query: &str,
        kb_id: &str,
    ) -> Result<Vec<RetrievedChunk>, GatewayError> {
        let body = json!({
            "query": query,
            "kb_id": kb_id,
            "top_k": self.top_k,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream(format!("rag request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(GatewayError::Upstream(format!(
                "rag returned status {}",
                response.status()
            )));
        }

        let decoded: RetrieveResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Upstream(format!("rag response decode failed: {e}")))?;
        Ok(decoded.chunks)
    }
}

/// Retrieval stand-in: returns nothing, so generation proceeds contextless
pub struct MockRetriever;

impl MockRetriever {
    pub fn new() -> Self {
        tracing::info!("RAG engine initialized (mock mode)");
        Self
    }
}

#[async_trait]
impl KnowledgeRetriever for MockRetriever {
    async fn retrieve(
        &self,
        _query: &str,
        _kb_id: &str,
    ) -> Result<Vec<RetrievedChunk>, GatewayError> {
        Ok(Vec::new())
    }
}
