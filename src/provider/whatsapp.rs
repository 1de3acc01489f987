//! WhatsApp provider backed by a bridge process.
//!
//! The bridge owns the actual WhatsApp session and exposes a small HTTP
//! surface: `POST /send` for outbound messages and direct URLs for media
//! downloads. Inbound traffic arrives as JSON events on our webhook (see
//! `crate::webhook`) and is decoded here into [`ProviderEvent`] values.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::traits::{
    InboundMessage, MediaKind, MediaRef, MessagingProvider, OutgoingMessage, ProviderError,
    ProviderEvent, QuotedMessage, ReactionEvent, SendOptions,
};

/// WhatsApp bridge configuration
#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    /// Base URL of the bridge process
    pub bridge_url: String,
    /// Bearer token the bridge expects, if configured
    pub api_token: Option<String>,
    /// Directory media downloads are written to
    pub download_dir: PathBuf,
    /// Maximum characters per outbound message before splitting
    pub max_message_length: usize,
}

impl WhatsAppConfig {
    pub fn new(bridge_url: &str, api_token: Option<String>, download_dir: PathBuf) -> Self {
        Self {
            bridge_url: bridge_url.trim_end_matches('/').to_string(),
            api_token,
            download_dir,
            max_message_length: 4096,
        }
    }
}

/// WhatsApp messaging provider
pub struct WhatsAppProvider {
    config: WhatsAppConfig,
    client: Client,
}

#[derive(Debug, Serialize)]
struct BridgeSendRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    media_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quote_id: Option<&'a str>,
    mentions: &'a [String],
}

#[derive(Debug, Deserialize)]
struct BridgeSendResponse {
    message_id: String,
}

impl WhatsAppProvider {
    pub fn new(config: WhatsAppConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    async fn send_bridge_message(
        &self,
        chat_id: &str,
        text: &str,
        media_url: Option<&str>,
        mentions: &[String],
        quote_id: Option<&str>,
    ) -> Result<String, ProviderError> {
        let request = BridgeSendRequest {
            chat_id,
            text,
            media_url,
            quote_id,
            mentions,
        };

        let mut builder = self
            .client
            .post(format!("{}/send", self.config.bridge_url))
            .timeout(Duration::from_secs(30))
            .json(&request);
        if let Some(token) = &self.config.api_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::ConnectionFailed(e.to_string()))?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited(60));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::SendFailed(format!("{}: {}", status, body)));
        }

        let parsed: BridgeSendResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::SendFailed(format!("bad bridge response: {}", e)))?;
        Ok(parsed.message_id)
    }
}

#[async_trait]
impl MessagingProvider for WhatsAppProvider {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<String, ProviderError> {
        self.send_message(chat_id, &OutgoingMessage::text(text), &SendOptions::default())
            .await
    }

    async fn send_message(
        &self,
        chat_id: &str,
        message: &OutgoingMessage,
        options: &SendOptions,
    ) -> Result<String, ProviderError> {
        let chunks = split_message(&message.text, self.config.max_message_length);
        let total = chunks.len();
        let mut last_id = String::new();

        for (i, chunk) in chunks.iter().enumerate() {
            // Media and the quote reference ride on the first chunk only.
            let media_url = if i == 0 { message.media_url.as_deref() } else { None };
            let quote_id = if i == 0 { options.quote.as_deref() } else { None };

            last_id = self
                .send_bridge_message(chat_id, chunk, media_url, &message.mentions, quote_id)
                .await?;

            if i + 1 < total {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        Ok(last_id)
    }

    async fn save_file(&self, media: &MediaRef) -> Result<PathBuf, ProviderError> {
        let url = media.url.as_deref().ok_or_else(|| {
            ProviderError::MediaDownloadFailed("bridge supplied no media URL".to_string())
        })?;

        let mut builder = self.client.get(url).timeout(Duration::from_secs(60));
        if let Some(token) = &self.config.api_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::MediaDownloadFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ProviderError::MediaDownloadFailed(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProviderError::MediaDownloadFailed(e.to_string()))?;

        tokio::fs::create_dir_all(&self.config.download_dir)
            .await
            .map_err(|e| ProviderError::MediaDownloadFailed(e.to_string()))?;
        let path = self
            .config
            .download_dir
            .join(format!("{}.{}", Uuid::new_v4(), file_extension(media.kind)));
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| ProviderError::MediaDownloadFailed(e.to_string()))?;

        debug!("Saved {} bytes of media to {}", bytes.len(), path.display());
        Ok(path)
    }
}

pub(crate) fn file_extension(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Image => "jpg",
        MediaKind::Audio => "ogg",
        MediaKind::Video => "mp4",
        MediaKind::Document => "bin",
    }
}

/// Split long text into chunks the network accepts, preferring line breaks.
pub(crate) fn split_message(text: &str, limit: usize) -> Vec<String> {
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for line in text.split('\n') {
        let line_len = line.chars().count();

        if line_len > limit {
            if current_len > 0 {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            // Hard-split a single oversized line on char boundaries.
            for ch in line.chars() {
                current.push(ch);
                current_len += 1;
                if current_len == limit {
                    chunks.push(std::mem::take(&mut current));
                    current_len = 0;
                }
            }
            continue;
        }

        let needed = if current_len == 0 { line_len } else { line_len + 1 };
        if current_len + needed > limit {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if current_len > 0 {
            current.push('\n');
            current_len += 1;
        }
        current.push_str(line);
        current_len += line_len;
    }

    if current_len > 0 {
        chunks.push(current);
    }

    chunks
}

/// Event payload the bridge posts to our webhook
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BridgeEvent {
    Message(BridgeMessage),
    Reaction(BridgeReactionBatch),
}

#[derive(Debug, Deserialize)]
pub struct BridgeMessage {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub media: Option<BridgeMedia>,
    #[serde(default)]
    pub quoted: Option<BridgeQuoted>,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Deserialize)]
pub struct BridgeMedia {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BridgeQuoted {
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BridgeReactionBatch {
    pub reactions: Vec<BridgeReaction>,
}

#[derive(Debug, Deserialize)]
pub struct BridgeReaction {
    pub message_id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub emoji: String,
}

impl From<BridgeEvent> for ProviderEvent {
    fn from(event: BridgeEvent) -> Self {
        match event {
            BridgeEvent::Message(m) => ProviderEvent::Message(InboundMessage {
                id: m.id,
                chat_id: m.chat_id,
                sender_id: m.sender_id,
                sender_name: m.sender_name,
                is_group: m.is_group,
                body: m.body,
                media: m.media.map(|media| MediaRef {
                    id: media.id,
                    kind: media_kind(&media.kind),
                    url: media.url,
                }),
                quoted: m.quoted.map(|q| QuotedMessage {
                    sender_id: q.sender_id,
                    body: q.body.unwrap_or_default(),
                }),
                timestamp: m.timestamp,
            }),
            BridgeEvent::Reaction(batch) => ProviderEvent::Reactions(
                batch
                    .reactions
                    .into_iter()
                    .map(|r| ReactionEvent {
                        message_id: r.message_id,
                        chat_id: r.chat_id,
                        sender_id: r.sender_id,
                        emoji: r.emoji,
                    })
                    .collect(),
            ),
        }
    }
}

fn media_kind(kind: &str) -> MediaKind {
    match kind {
        "image" | "sticker" => MediaKind::Image,
        // "ptt" is a WhatsApp voice note
        "audio" | "ptt" => MediaKind::Audio,
        "video" => MediaKind::Video,
        _ => MediaKind::Document,
    }
}
