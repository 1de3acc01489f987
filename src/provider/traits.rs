//! Common abstractions for messaging providers.
//!
//! A provider connects one chat network (WhatsApp bridge, Telegram) to the
//! bot. Inbound traffic is normalized into [`ProviderEvent`] values; outbound
//! traffic goes through the [`MessagingProvider`] trait so flows never touch
//! network-specific types.

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in provider operations
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Rate limited: retry after {0} seconds")]
    RateLimited(u64),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Media download failed: {0}")]
    MediaDownloadFailed(String),

    #[error("Provider not ready: {0}")]
    NotReady(String),
}

impl ProviderError {
    /// True for errors worth retrying after a pause.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ProviderError::RateLimited(_))
    }
}

/// Kind of media attached to a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    Document,
}

/// Reference to a media object held by the provider.
///
/// `id` is the provider's handle (file id, media key). `url` is set when the
/// provider exposes a direct download link instead.
#[derive(Debug, Clone)]
pub struct MediaRef {
    pub id: String,
    pub kind: MediaKind,
    pub url: Option<String>,
}

/// A message the inbound message replies to
#[derive(Debug, Clone)]
pub struct QuotedMessage {
    pub sender_id: Option<String>,
    pub body: String,
}

/// Normalized inbound message, independent of the source network
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Provider-scoped message id
    pub id: String,
    /// Conversation the message belongs to (group or direct chat)
    pub chat_id: String,
    /// Stable id of the sender within the provider
    pub sender_id: String,
    /// Display name, when the provider reports one
    pub sender_name: Option<String>,
    /// Whether the chat is a group conversation
    pub is_group: bool,
    /// Text body; empty for pure media messages
    pub body: String,
    pub media: Option<MediaRef>,
    pub quoted: Option<QuotedMessage>,
    /// Unix timestamp in seconds
    pub timestamp: i64,
}

impl InboundMessage {
    /// Plain text message with no media or quote, for tests.
    #[cfg(test)]
    pub fn text(id: &str, chat_id: &str, sender_id: &str, body: &str) -> Self {
        Self {
            id: id.to_string(),
            chat_id: chat_id.to_string(),
            sender_id: sender_id.to_string(),
            sender_name: None,
            is_group: false,
            body: body.to_string(),
            media: None,
            quoted: None,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// An emoji reaction applied to an earlier message
#[derive(Debug, Clone)]
pub struct ReactionEvent {
    /// Id of the message the reaction targets
    pub message_id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub emoji: String,
}

/// Everything a provider can push into the event loop
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    Message(InboundMessage),
    /// Reaction updates arrive batched; providers may report several at once.
    Reactions(Vec<ReactionEvent>),
}

/// Outbound message payload
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub text: String,
    /// Sender ids to mention, for networks that support it
    pub mentions: Vec<String>,
    /// Publicly fetchable media URL to attach
    pub media_url: Option<String>,
}

impl OutgoingMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_media(text: impl Into<String>, media_url: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            media_url: Some(media_url.into()),
            ..Default::default()
        }
    }
}

/// Per-send options
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Message id to reply to
    pub quote: Option<String>,
}

/// Outbound side of a messaging network.
///
/// Implementations must be cheap to clone behind an `Arc` and safe to call
/// concurrently; the event loop sends from several flows at once.
#[async_trait]
pub trait MessagingProvider: Send + Sync {
    /// Short provider name for logs
    fn name(&self) -> &str;

    /// Send plain text. Returns the provider-scoped id of the sent message.
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<String, ProviderError>;

    /// Send a full outbound payload. Returns the id of the sent message
    /// (the last chunk when the provider splits long texts).
    async fn send_message(
        &self,
        chat_id: &str,
        message: &OutgoingMessage,
        options: &SendOptions,
    ) -> Result<String, ProviderError>;

    /// Download referenced media to local disk and return its path.
    async fn save_file(&self, media: &MediaRef) -> Result<PathBuf, ProviderError>;
}
