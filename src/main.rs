//! Vigil Bot - Entry Point
//!
//! Modes:
//! - Default: WhatsApp via the bridge webhook
//! - --telegram / -t: Telegram long polling

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use vigil_bot::alerts::{spawn_alert_listener, AlertDispatchContext};
use vigil_bot::bot::{spawn_feedback_notifier, Bot};
use vigil_bot::config::Config;
use vigil_bot::feedback::{FeedbackAggregator, FeedbackConfig};
use vigil_bot::gateway::{ActorGateway, HttpActorGateway};
use vigil_bot::provider::{
    MessagingProvider, RetryPolicy, TelegramProvider, WhatsAppConfig, WhatsAppProvider,
};
use vigil_bot::retrieval::RetrievalPipeline;
use vigil_bot::session::{SessionLimits, SessionStore};
use vigil_bot::storage::{ensure_bucket, HttpObjectStorage, SignedUrlCache};
use vigil_bot::store::{RecordStore, SqliteStore, ANOMALIES_TABLE};
use vigil_bot::webhook::run_webhook_server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().collect();
    let telegram_mode = args.iter().any(|a| a == "--telegram" || a == "-t");
    let help_mode = args.iter().any(|a| a == "--help" || a == "-h");

    if help_mode {
        println!("Vigil Bot v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: vigil-bot [OPTIONS]");
        println!();
        println!("Options:");
        println!("  --telegram, -t  Run on Telegram (long polling)");
        println!("  --help, -h      Show this help");
        println!();
        println!("Default: Run on WhatsApp via the bridge webhook");
        println!();
        println!("Environment variables:");
        println!("  VIGIL_GATEWAY_URL     Actor gateway base URL");
        println!("  VIGIL_BRIDGE_URL      WhatsApp bridge base URL");
        println!("  VIGIL_BRIDGE_TOKEN    WhatsApp bridge bearer token");
        println!("  TELEGRAM_BOT_TOKEN    Telegram bot token");
        println!("  VIGIL_WEBHOOK_ADDR    Webhook bind address (default 0.0.0.0:8088)");
        println!("  VIGIL_STORAGE_URL     Object storage gateway URL");
        println!("  VIGIL_ALERT_CHATS     Comma-separated alert chat ids");
        println!("  VIGIL_DB_PATH         SQLite database path");
        return Ok(());
    }

    // Setup logging
    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Vigil Bot v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;

    if let Some(parent) = config.db_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let store = Arc::new(SqliteStore::open(&config.db_path)?);
    info!("Database at {}", config.db_path.display());

    let gateway: Arc<dyn ActorGateway> = Arc::new(HttpActorGateway::new(&config.gateway_url));

    let limits = SessionLimits {
        max_chars: config.max_history_chars,
        max_messages: config.max_history_messages,
        max_quotes: config.max_quotes,
    };
    let sessions = Arc::new(SessionStore::new(store.clone(), gateway.clone(), limits));

    let feedback_config = FeedbackConfig {
        window: Duration::from_secs(config.feedback_window_secs),
        ..FeedbackConfig::default()
    };
    let (feedback, feedback_events) = FeedbackAggregator::new(store.clone(), feedback_config);

    // Cached URLs expire at half the signing window so none are handed out dead.
    let storage = Arc::new(SignedUrlCache::new(
        Arc::new(HttpObjectStorage::new(&config.storage_url)),
        1_000,
        config.signed_url_expiry_secs / 2,
    ));
    ensure_bucket(storage.as_ref(), &config.snapshot_bucket).await?;

    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let provider: Arc<dyn MessagingProvider> = if telegram_mode {
        let token = config
            .telegram_token
            .clone()
            .ok_or_else(|| anyhow::anyhow!("TELEGRAM_BOT_TOKEN is not set"))?;
        let telegram = Arc::new(TelegramProvider::new(&token, config.download_dir.clone()));

        let listener = telegram.clone();
        let tx = event_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = listener.listen(tx).await {
                error!("Telegram listener exited: {}", e);
            }
        });
        telegram
    } else {
        let whatsapp = Arc::new(WhatsAppProvider::new(WhatsAppConfig::new(
            &config.bridge_url,
            config.bridge_token.clone(),
            config.download_dir.clone(),
        )));

        let addr = config.webhook_addr.parse()?;
        let tx = event_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = run_webhook_server(addr, tx).await {
                error!("Webhook server exited: {}", e);
            }
        });
        whatsapp
    };
    // The listener tasks own the remaining senders; dropping this one lets
    // the event loop end when they shut down.
    drop(event_tx);

    info!("Provider: {}", provider.name());

    spawn_feedback_notifier(provider.clone(), feedback_events);

    let alert_ctx = AlertDispatchContext {
        provider: provider.clone(),
        storage: storage.clone(),
        feedback: feedback.clone(),
        alert_chats: config.alert_chats.clone(),
        bucket: config.snapshot_bucket.clone(),
        signed_url_expiry_secs: config.signed_url_expiry_secs,
        retry: RetryPolicy::default(),
    };
    spawn_alert_listener(alert_ctx, store.subscribe(ANOMALIES_TABLE));
    if config.alert_chats.is_empty() {
        info!("No alert chats configured, anomaly alerts stay unsent");
    } else {
        info!("Alerting {} chat(s) on new anomalies", config.alert_chats.len());
    }

    let retrieval = RetrievalPipeline::new(gateway.clone());
    let bot = Arc::new(Bot {
        provider,
        gateway,
        sessions,
        retrieval,
        feedback,
        system_prompt: config.system_prompt.clone(),
        retry: RetryPolicy::default(),
    });

    bot.run(event_rx).await;

    info!("Vigil Bot stopped");
    Ok(())
}
