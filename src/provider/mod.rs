//! Messaging provider implementations.
//!
//! One provider is selected at startup and drives the whole process:
//! - WhatsApp via a bridge process (default)
//! - Telegram via long polling
//!
//! Each network implements the `MessagingProvider` trait and feeds
//! normalized `ProviderEvent` values into the bot's event loop.

pub mod retry;
pub mod telegram;
pub mod traits;
pub mod whatsapp;

pub use retry::{with_retry, RetryPolicy};
pub use telegram::TelegramProvider;
pub use traits::{
    InboundMessage, MediaKind, MediaRef, MessagingProvider, OutgoingMessage, ProviderError,
    ProviderEvent, QuotedMessage, ReactionEvent, SendOptions,
};
pub use whatsapp::{BridgeEvent, WhatsAppConfig, WhatsAppProvider};
