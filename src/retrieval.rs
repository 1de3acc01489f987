//! Retrieval Pipeline
//!
//! Builds the model's context window out of two sources: semantically
//! relevant older turns and the latest verbatim turns. Older turns are
//! recalled through the gateway's similarity index, cross-referenced back
//! against the in-memory pool by exact text, then reranked.
//!
//! A separate facts path searches the standalone fact index and returns a
//! newline-joined block for the system prompt.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::FlowError;
use crate::gateway::{ActorGateway, CONVERSATION_TAG, FACTS_TAG};
use crate::session::ChatMessage;

/// Candidates requested from similarity search
const SIMILARITY_K: usize = 20;

/// Minimum similarity for a candidate to count
const SIMILARITY_THRESHOLD: f32 = 0.5;

/// Newest turns passed through verbatim, skipping recall entirely
const LATEST_WINDOW: usize = 10;

/// Reranked candidates kept
const RERANK_KEEP: usize = 10;

/// A context message selected for the prompt
#[derive(Debug, Clone, PartialEq)]
pub struct RankedMessage {
    pub role: String,
    pub content: String,
}

impl From<&ChatMessage> for RankedMessage {
    fn from(m: &ChatMessage) -> Self {
        Self {
            role: m.role.clone(),
            content: m.text.clone(),
        }
    }
}

/// Recall-and-rerank over the gateway's embedding indexes
pub struct RetrievalPipeline {
    gateway: Arc<dyn ActorGateway>,
}

impl RetrievalPipeline {
    pub fn new(gateway: Arc<dyn ActorGateway>) -> Self {
        Self { gateway }
    }

    /// Select context for a query from the session's history pool.
    ///
    /// The pool is split chronologically: everything older than the last
    /// `LATEST_WINDOW` turns goes through similarity search and rerank,
    /// the window itself is appended verbatim in chronological order.
    /// Rerank keeps at most `RERANK_KEEP` candidates, weakest score first;
    /// candidates with equal scores keep the ranker's ordering.
    pub async fn retrieve_relevant(
        &self,
        query: &str,
        pool: &[ChatMessage],
    ) -> Result<Vec<RankedMessage>, FlowError> {
        let mut sorted: Vec<&ChatMessage> = pool.iter().collect();
        sorted.sort_by_key(|m| m.created_at);

        let split = sorted.len().saturating_sub(LATEST_WINDOW);
        let (older, latest) = sorted.split_at(split);

        let mut ranked: Vec<RankedMessage> = Vec::new();

        if !older.is_empty() {
            let hits = self
                .gateway
                .similarity(query, CONVERSATION_TAG, SIMILARITY_K, SIMILARITY_THRESHOLD)
                .await?;

            // Cross-reference recalled texts back to pool entries; anything
            // the index returns that is no longer in the pool is dropped.
            let candidates: Vec<&ChatMessage> = hits
                .iter()
                .filter_map(|hit| older.iter().find(|m| m.text == hit.text).copied())
                .collect();

            if !candidates.is_empty() {
                let texts: Vec<String> = candidates.iter().map(|m| m.text.clone()).collect();
                let mut scored = self.gateway.rerank(query, &texts).await?;

                // Ascending: the strongest candidates end up adjacent to
                // the verbatim window.
                scored.sort_by(|a, b| {
                    a.score
                        .partial_cmp(&b.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                scored.truncate(RERANK_KEEP);

                for item in &scored {
                    match candidates.get(item.index) {
                        Some(m) => ranked.push(RankedMessage::from(*m)),
                        None => warn!("Rerank returned out-of-range index {}", item.index),
                    }
                }
            }
        }

        ranked.extend(latest.iter().map(|m| RankedMessage::from(*m)));

        debug!(
            "Retrieved {} context messages ({} recalled, {} verbatim)",
            ranked.len(),
            ranked.len() - latest.len(),
            latest.len()
        );

        Ok(ranked)
    }

    /// Recall standalone facts relevant to a query, strongest first,
    /// rendered as one newline-joined block. Empty string when the fact
    /// index has nothing above the threshold.
    pub async fn retrieve_facts(&self, query: &str) -> Result<String, FlowError> {
        let hits = self
            .gateway
            .similarity(query, FACTS_TAG, SIMILARITY_K, SIMILARITY_THRESHOLD)
            .await?;

        if hits.is_empty() {
            return Ok(String::new());
        }

        let texts: Vec<String> = hits.iter().map(|h| h.text.clone()).collect();
        let mut scored = self.gateway.rerank(query, &texts).await?;

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(RERANK_KEEP);

        let lines: Vec<&str> = scored
            .iter()
            .filter_map(|item| texts.get(item.index).map(|s| s.as_str()))
            .collect();

        Ok(lines.join("\n"))
    }
}
