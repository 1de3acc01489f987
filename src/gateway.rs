//! Actor Gateway
//!
//! HTTP client for the remote actor system that hosts the language model,
//! the embedding index and the image analyser. Every call carries a bounded
//! timeout; similarity search gets a longer one because the index may be
//! cold-loading on the remote side.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::FlowError;

/// Timeout applied to chat, embeddings, rerank and analyze calls
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout applied to similarity search
const SIMILARITY_TIMEOUT: Duration = Duration::from_secs(60);

/// Embedding-index tag for conversation turns
pub const CONVERSATION_TAG: &str = "conversation";

/// Embedding-index tag for standalone facts
pub const FACTS_TAG: &str = "facts";

/// One prompt message on the chat wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// One similarity-search hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityHit {
    pub text: String,
    pub similarity: f32,
}

/// One rerank score, indexed into the candidate list that was sent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankItem {
    pub index: usize,
    pub score: f32,
}

/// Result of a remote image analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAnalysis {
    /// Id of the analysis record created remotely
    pub analysis_id: String,
    /// Record the analysis points at (anomaly or standalone snapshot)
    pub target_ref: String,
    /// Model-written description of the image
    pub results: String,
}

/// Remote operations exposed by the actor system
#[async_trait]
pub trait ActorGateway: Send + Sync {
    /// Run a chat completion over an assembled message list
    async fn chat(&self, messages: &[ChatTurn], session_id: &str) -> Result<ChatTurn, FlowError>;

    /// Index texts under a tag. Fire-and-forget from the caller's view
    async fn embeddings(&self, texts: &[String], tag: &str) -> Result<(), FlowError>;

    /// Top-k semantic search over texts indexed under `tag`
    async fn similarity(
        &self,
        query: &str,
        tag: &str,
        k: usize,
        threshold: f32,
    ) -> Result<Vec<SimilarityHit>, FlowError>;

    /// Score candidate texts against a query. Scores come back indexed,
    /// in whatever order the remote ranker produced.
    async fn rerank(&self, query: &str, texts: &[String]) -> Result<Vec<RerankItem>, FlowError>;

    /// Analyze an image file, optionally steered by a caption
    async fn analyze_image(
        &self,
        image_path: &Path,
        caption: Option<&str>,
    ) -> Result<ImageAnalysis, FlowError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    messages: &'a [ChatTurn],
    session_id: &'a str,
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    texts: &'a [String],
    tag: &'a str,
}

#[derive(Debug, Serialize)]
struct SimilarityRequest<'a> {
    query: &'a str,
    tag: &'a str,
    k: usize,
    threshold: f32,
}

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    texts: &'a [String],
}

#[derive(Debug, Serialize)]
struct AnalyzeRequest<'a> {
    image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    caption: Option<&'a str>,
}

/// Gateway client over plain HTTP
#[derive(Clone)]
pub struct HttpActorGateway {
    client: Client,
    base_url: String,
}

impl HttpActorGateway {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post<Req: Serialize>(
        &self,
        endpoint: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<reqwest::Response, FlowError> {
        let url = format!("{}/{}", self.base_url, endpoint);

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| FlowError::TransientRemote(format!("{} request failed: {}", endpoint, e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(FlowError::TransientRemote(format!(
                "{} returned {}: {}",
                endpoint, status, text
            )));
        }

        Ok(response)
    }
}

#[async_trait]
impl ActorGateway for HttpActorGateway {
    async fn chat(&self, messages: &[ChatTurn], session_id: &str) -> Result<ChatTurn, FlowError> {
        debug!("Gateway chat: session={}, messages={}", session_id, messages.len());

        let response = self
            .post("chat", &ChatRequest { messages, session_id }, DEFAULT_TIMEOUT)
            .await?;

        let turn: ChatTurn = response
            .json()
            .await
            .map_err(|e| FlowError::TransientRemote(format!("chat returned invalid body: {}", e)))?;

        Ok(turn)
    }

    async fn embeddings(&self, texts: &[String], tag: &str) -> Result<(), FlowError> {
        debug!("Gateway embeddings: tag={}, texts={}", tag, texts.len());

        self.post("embeddings", &EmbeddingsRequest { texts, tag }, DEFAULT_TIMEOUT)
            .await?;

        Ok(())
    }

    async fn similarity(
        &self,
        query: &str,
        tag: &str,
        k: usize,
        threshold: f32,
    ) -> Result<Vec<SimilarityHit>, FlowError> {
        debug!("Gateway similarity: tag={}, k={}, threshold={}", tag, k, threshold);

        let response = self
            .post(
                "similarity",
                &SimilarityRequest { query, tag, k, threshold },
                SIMILARITY_TIMEOUT,
            )
            .await?;

        let hits: Vec<SimilarityHit> = response.json().await.map_err(|e| {
            FlowError::TransientRemote(format!("similarity returned invalid body: {}", e))
        })?;

        Ok(hits)
    }

    async fn rerank(&self, query: &str, texts: &[String]) -> Result<Vec<RerankItem>, FlowError> {
        debug!("Gateway rerank: candidates={}", texts.len());

        let response = self
            .post("rerank", &RerankRequest { query, texts }, DEFAULT_TIMEOUT)
            .await?;

        let items: Vec<RerankItem> = response.json().await.map_err(|e| {
            FlowError::TransientRemote(format!("rerank returned invalid body: {}", e))
        })?;

        Ok(items)
    }

    async fn analyze_image(
        &self,
        image_path: &Path,
        caption: Option<&str>,
    ) -> Result<ImageAnalysis, FlowError> {
        let bytes = tokio::fs::read(image_path)
            .await
            .map_err(|e| FlowError::Validation(format!("cannot read image {}: {}", image_path.display(), e)))?;

        debug!(
            "Gateway analyze: file={}, bytes={}, caption={}",
            image_path.display(),
            bytes.len(),
            caption.is_some()
        );

        let request = AnalyzeRequest {
            image: BASE64.encode(&bytes),
            caption,
        };

        let response = self.post("analyze", &request, DEFAULT_TIMEOUT).await?;

        let analysis: ImageAnalysis = response.json().await.map_err(|e| {
            FlowError::TransientRemote(format!("analyze returned invalid body: {}", e))
        })?;

        Ok(analysis)
    }
}
