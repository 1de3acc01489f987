//! Telegram provider built on long polling.
//!
//! Uses the explicit Dispatcher pattern for reliable update handling. Note
//! that `message_reaction` updates are opt-in on the Bot API, so the polling
//! listener names its allowed update kinds instead of taking the default set.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use teloxide::{
    dispatching::{Dispatcher, UpdateFilterExt},
    dptree,
    error_handlers::LoggingErrorHandler,
    net::Download,
    prelude::*,
    types::{
        AllowedUpdate, InputFile, MessageId, MessageReactionUpdated, ReactionType,
        ReplyParameters, Update,
    },
    update_listeners::Polling,
    RequestError,
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};
use uuid::Uuid;

use super::traits::{
    InboundMessage, MediaKind, MediaRef, MessagingProvider, OutgoingMessage, ProviderError,
    ProviderEvent, QuotedMessage, ReactionEvent, SendOptions,
};
use super::whatsapp::{file_extension, split_message};

/// Telegram message size limits
const TEXT_LIMIT: usize = 4096;
const CAPTION_LIMIT: usize = 1024;

/// Telegram messaging provider
pub struct TelegramProvider {
    bot: Bot,
    download_dir: PathBuf,
}

impl TelegramProvider {
    pub fn new(token: &str, download_dir: PathBuf) -> Self {
        Self {
            bot: Bot::new(token),
            download_dir,
        }
    }

    /// Run the long-polling loop, forwarding normalized updates into `tx`.
    /// Blocks until the process shuts down.
    pub async fn listen(&self, tx: UnboundedSender<ProviderEvent>) -> Result<()> {
        let me = self
            .bot
            .get_me()
            .await
            .context("Failed to connect to Telegram (check TELEGRAM_BOT_TOKEN)")?;
        info!("Connected to Telegram as @{}", me.username());

        let handler = dptree::entry()
            .branch(Update::filter_message().endpoint(on_message))
            .branch(Update::filter_message_reaction_updated().endpoint(on_reaction));

        let listener = Polling::builder(self.bot.clone())
            .allowed_updates(vec![AllowedUpdate::Message, AllowedUpdate::MessageReaction])
            .build();

        Dispatcher::builder(self.bot.clone(), handler)
            .dependencies(dptree::deps![tx])
            .default_handler(|upd| async move {
                debug!("Unhandled update: {:?}", upd);
            })
            .error_handler(LoggingErrorHandler::with_custom_text(
                "Error in update handler",
            ))
            .enable_ctrlc_handler()
            .build()
            .dispatch_with_listener(
                listener,
                LoggingErrorHandler::with_custom_text("Telegram polling error"),
            )
            .await;

        Ok(())
    }
}

#[async_trait]
impl MessagingProvider for TelegramProvider {
    fn name(&self) -> &str {
        "telegram"
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
        let chat = parse_chat(chat_id)?;
        let reply = options.quote.as_deref().and_then(parse_message_id);

        if let Some(media_url) = &message.media_url {
            let url = reqwest::Url::parse(media_url)
                .map_err(|e| ProviderError::SendFailed(format!("bad media URL: {}", e)))?;
            let caption_fits = message.text.chars().count() <= CAPTION_LIMIT;

            let mut request = self.bot.send_photo(chat, InputFile::url(url));
            if caption_fits && !message.text.is_empty() {
                request = request.caption(message.text.clone());
            }
            if let Some(reply_to) = reply {
                request = request.reply_parameters(ReplyParameters::new(reply_to));
            }
            let sent = request.await.map_err(map_send_error)?;
            if caption_fits {
                return Ok(sent.id.0.to_string());
            }

            // Caption over the photo limit, deliver the text separately.
            let mut last = sent.id.0.to_string();
            for chunk in split_message(&message.text, TEXT_LIMIT) {
                let sent = self
                    .bot
                    .send_message(chat, chunk)
                    .await
                    .map_err(map_send_error)?;
                last = sent.id.0.to_string();
            }
            return Ok(last);
        }

        let chunks = split_message(&message.text, TEXT_LIMIT);
        let total = chunks.len();
        let mut last = String::new();
        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut request = self.bot.send_message(chat, chunk);
            if i == 0 {
                if let Some(reply_to) = reply {
                    request = request.reply_parameters(ReplyParameters::new(reply_to));
                }
            }
            let sent = request.await.map_err(map_send_error)?;
            last = sent.id.0.to_string();
            if i + 1 < total {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        Ok(last)
    }

    async fn save_file(&self, media: &MediaRef) -> Result<PathBuf, ProviderError> {
        let file = self
            .bot
            .get_file(&media.id)
            .await
            .map_err(|e| ProviderError::MediaDownloadFailed(e.to_string()))?;

        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .map_err(|e| ProviderError::MediaDownloadFailed(e.to_string()))?;
        let path = self
            .download_dir
            .join(format!("{}.{}", Uuid::new_v4(), file_extension(media.kind)));
        let mut dst = tokio::fs::File::create(&path)
            .await
            .map_err(|e| ProviderError::MediaDownloadFailed(e.to_string()))?;
        self.bot
            .download_file(&file.path, &mut dst)
            .await
            .map_err(|e| ProviderError::MediaDownloadFailed(e.to_string()))?;

        debug!("Saved Telegram file {} to {}", media.id, path.display());
        Ok(path)
    }
}

async fn on_message(msg: Message, tx: UnboundedSender<ProviderEvent>) -> ResponseResult<()> {
    if let Some(inbound) = inbound_from_message(&msg) {
        let _ = tx.send(ProviderEvent::Message(inbound));
    }
    Ok(())
}

async fn on_reaction(
    update: MessageReactionUpdated,
    tx: UnboundedSender<ProviderEvent>,
) -> ResponseResult<()> {
    let sender_id = match &update.user {
        Some(user) => user.id.to_string(),
        // Anonymous admins react as the chat itself.
        None => match &update.actor_chat {
            Some(chat) => chat.id.to_string(),
            None => return Ok(()),
        },
    };

    let reactions: Vec<ReactionEvent> = update
        .new_reaction
        .iter()
        .filter_map(reaction_emoji)
        .map(|emoji| ReactionEvent {
            message_id: update.message_id.0.to_string(),
            chat_id: update.chat.id.to_string(),
            sender_id: sender_id.clone(),
            emoji: emoji.to_string(),
        })
        .collect();

    if !reactions.is_empty() {
        let _ = tx.send(ProviderEvent::Reactions(reactions));
    }
    Ok(())
}

fn inbound_from_message(msg: &Message) -> Option<InboundMessage> {
    let from = msg.from.as_ref()?;
    let body = msg
        .text()
        .or_else(|| msg.caption())
        .unwrap_or_default()
        .to_string();

    let media = if let Some(photo) = msg.photo().and_then(|sizes| sizes.last()) {
        Some(MediaRef {
            id: photo.file.id.clone(),
            kind: MediaKind::Image,
            url: None,
        })
    } else if let Some(video) = msg.video() {
        Some(MediaRef {
            id: video.file.id.clone(),
            kind: MediaKind::Video,
            url: None,
        })
    } else if let Some(voice) = msg.voice() {
        Some(MediaRef {
            id: voice.file.id.clone(),
            kind: MediaKind::Audio,
            url: None,
        })
    } else if let Some(doc) = msg.document() {
        Some(MediaRef {
            id: doc.file.id.clone(),
            kind: MediaKind::Document,
            url: None,
        })
    } else {
        None
    };

    // Service messages (joins, pins) carry neither text nor media.
    if body.is_empty() && media.is_none() {
        return None;
    }

    let quoted = msg.reply_to_message().map(|reply| QuotedMessage {
        sender_id: reply.from.as_ref().map(|u| u.id.to_string()),
        body: reply
            .text()
            .or_else(|| reply.caption())
            .unwrap_or_default()
            .to_string(),
    });

    Some(InboundMessage {
        id: msg.id.0.to_string(),
        chat_id: msg.chat.id.to_string(),
        sender_id: from.id.to_string(),
        sender_name: Some(from.full_name()),
        is_group: msg.chat.is_group() || msg.chat.is_supergroup(),
        body,
        media,
        quoted,
        timestamp: msg.date.timestamp(),
    })
}

fn reaction_emoji(reaction: &ReactionType) -> Option<&str> {
    match reaction {
        ReactionType::Emoji { emoji } => Some(emoji),
        // Custom emoji and paid reactions have no stable meaning for voting.
        _ => None,
    }
}

fn parse_chat(chat_id: &str) -> Result<ChatId, ProviderError> {
    chat_id
        .parse::<i64>()
        .map(ChatId)
        .map_err(|_| ProviderError::InvalidRecipient(chat_id.to_string()))
}

fn parse_message_id(id: &str) -> Option<MessageId> {
    id.parse::<i32>().ok().map(MessageId)
}

fn map_send_error(err: RequestError) -> ProviderError {
    match err {
        RequestError::RetryAfter(secs) => ProviderError::RateLimited(secs.seconds() as u64),
        other => ProviderError::SendFailed(other.to_string()),
    }
}
