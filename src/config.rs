//! Configuration management

use anyhow::Result;
use std::path::PathBuf;

const DEFAULT_SYSTEM_PROMPT: &str = "You are Vigil, an assistant embedded in a group chat for a camera \
monitoring deployment. You answer questions about the site, the cameras and past anomaly alerts. \
Keep replies short and conversational.";

/// Bot configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// System prompt seeded into every new conversation
    pub system_prompt: String,

    /// SQLite database path (conversations + anomalies)
    pub db_path: PathBuf,

    /// Directory for downloaded media awaiting analysis
    pub download_dir: PathBuf,

    /// Base URL of the actor gateway (chat, embeddings, similarity, rerank, analyze)
    pub gateway_url: String,

    /// Base URL of the WhatsApp bridge
    pub bridge_url: String,

    /// Bearer token for the WhatsApp bridge (optional)
    pub bridge_token: Option<String>,

    /// Telegram bot token (optional - enables the Telegram provider)
    pub telegram_token: Option<String>,

    /// Listen address for the webhook shim
    pub webhook_addr: String,

    /// Base URL of the object-storage facade (signed snapshot URLs)
    pub storage_url: String,

    /// Bucket holding anomaly snapshots
    pub snapshot_bucket: String,

    /// Expiry in seconds for signed snapshot URLs
    pub signed_url_expiry_secs: u64,

    /// Chats that receive anomaly alerts
    pub alert_chats: Vec<String>,

    /// Character budget for in-memory conversation history
    pub max_history_chars: usize,

    /// Message-count budget for in-memory conversation history
    pub max_history_messages: usize,

    /// Per-user quote cache capacity
    pub max_quotes: usize,

    /// Feedback collection window in seconds
    pub feedback_window_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let system_prompt = std::env::var("VIGIL_SYSTEM_PROMPT")
            .unwrap_or_else(|_| DEFAULT_SYSTEM_PROMPT.to_string());

        let db_path = std::env::var("VIGIL_DB_PATH")
            .map(|p| PathBuf::from(shellexpand::tilde(&p).as_ref()))
            .unwrap_or_else(|_| {
                dirs::data_local_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("vigil")
                    .join("vigil.db")
            });

        let download_dir = std::env::var("VIGIL_DOWNLOAD_DIR")
            .map(|p| PathBuf::from(shellexpand::tilde(&p).as_ref()))
            .unwrap_or_else(|_| std::env::temp_dir().join("vigil-media"));

        let gateway_url = std::env::var("VIGIL_GATEWAY_URL")
            .unwrap_or_else(|_| "http://localhost:8700".to_string());

        let bridge_url = std::env::var("VIGIL_BRIDGE_URL")
            .unwrap_or_else(|_| "http://localhost:3300".to_string());

        let bridge_token = std::env::var("VIGIL_BRIDGE_TOKEN").ok();

        let telegram_token = std::env::var("TELEGRAM_BOT_TOKEN").ok();

        let webhook_addr = std::env::var("VIGIL_WEBHOOK_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8088".to_string());

        let storage_url = std::env::var("VIGIL_STORAGE_URL")
            .unwrap_or_else(|_| "http://localhost:9000".to_string());

        let snapshot_bucket = std::env::var("VIGIL_SNAPSHOT_BUCKET")
            .unwrap_or_else(|_| "snapshots".to_string());

        let signed_url_expiry_secs = std::env::var("VIGIL_SIGNED_URL_EXPIRY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600);

        let alert_chats: Vec<String> = std::env::var("VIGIL_ALERT_CHATS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let max_history_chars = std::env::var("VIGIL_MAX_HISTORY_CHARS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(16_000);

        let max_history_messages = std::env::var("VIGIL_MAX_HISTORY_MESSAGES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(50);

        let max_quotes = std::env::var("VIGIL_MAX_QUOTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(20);

        let feedback_window_secs = std::env::var("VIGIL_FEEDBACK_WINDOW_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300);

        Ok(Self {
            system_prompt,
            db_path,
            download_dir,
            gateway_url,
            bridge_url,
            bridge_token,
            telegram_token,
            webhook_addr,
            storage_url,
            snapshot_bucket,
            signed_url_expiry_secs,
            alert_chats,
            max_history_chars,
            max_history_messages,
            max_quotes,
            feedback_window_secs,
        })
    }
}
