//! Inbound message routing.
//!
//! Every provider event lands here first and is classified into a flow:
//! image messages go to snap analysis, bang-prefixed keywords become
//! commands, everything else is a chat turn.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::provider::{InboundMessage, MediaKind};

static COMMAND_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^!(\w+)\s*(.*)$").expect("valid command regex"));

/// Flow a message is dispatched to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    /// Conversational turn through the retrieval pipeline
    Chat,
    /// Image attachment analyzed by the backend
    Snap,
    /// Bang-prefixed keyword command
    Command(Command),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Status,
    /// Direct fact lookup with the raw query text
    Facts(String),
    /// Unrecognized keyword, reported back to the user
    Unknown(String),
}

/// Classify an inbound message into its flow.
///
/// Images win over command text so a captioned snapshot is still analyzed.
pub fn classify(msg: &InboundMessage) -> Flow {
    if let Some(media) = &msg.media {
        if media.kind == MediaKind::Image {
            return Flow::Snap;
        }
    }

    if let Some(captures) = COMMAND_PATTERN.captures(msg.body.trim()) {
        let keyword = captures[1].to_lowercase();
        let args = captures
            .get(2)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();
        let command = match keyword.as_str() {
            "help" => Command::Help,
            "status" => Command::Status,
            "facts" => Command::Facts(args),
            _ => Command::Unknown(keyword),
        };
        return Flow::Command(command);
    }

    Flow::Chat
}
