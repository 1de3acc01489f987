//! Anomaly alert dispatch.
//!
//! A live-query subscription on the anomaly table drives this module: every
//! freshly created record is turned into a signed snapshot URL plus caption,
//! fanned out to the configured alert chats, and each dispatched message is
//! registered with the feedback aggregator so reactions count as correctness
//! votes.

use futures_util::future::join_all;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::FlowError;
use crate::feedback::FeedbackAggregator;
use crate::provider::{with_retry, MessagingProvider, OutgoingMessage, RetryPolicy, SendOptions};
use crate::storage::ObjectStorage;
use crate::store::{LiveAction, LiveNotification};

/// Everything one alert dispatch needs, handed to the listener at spawn time
/// so the reaction path never reads shared globals.
pub struct AlertDispatchContext {
    pub provider: Arc<dyn MessagingProvider>,
    pub storage: Arc<dyn ObjectStorage>,
    pub feedback: FeedbackAggregator,
    pub alert_chats: Vec<String>,
    pub bucket: String,
    pub signed_url_expiry_secs: u64,
    pub retry: RetryPolicy,
}

/// Spawn the background task draining anomaly notifications.
pub fn spawn_alert_listener(
    ctx: AlertDispatchContext,
    mut notifications: UnboundedReceiver<LiveNotification>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            // Status updates on existing anomalies are not re-announced.
            if notification.action != LiveAction::Create {
                continue;
            }
            if let Err(e) = dispatch_alert(&ctx, &notification.record).await {
                error!("Alert dispatch failed: {}", e);
            }
        }
        info!("Anomaly notification stream closed");
    })
}

/// Send one anomaly record to every alert chat.
pub async fn dispatch_alert(
    ctx: &AlertDispatchContext,
    record: &JsonValue,
) -> Result<(), FlowError> {
    let id = text_field(record, "id")?;
    let object_path = text_field(record, "object_path")?;
    let summary = text_field(record, "summary")?;
    let camera = record
        .get("camera")
        .and_then(JsonValue::as_str)
        .unwrap_or("unknown");

    let url = ctx
        .storage
        .presigned_get_object(&ctx.bucket, object_path, ctx.signed_url_expiry_secs)
        .await?;

    let caption = format!(
        "Anomaly on camera {}: {}\nReact with ✅/👍 if this is right, ❌/👎 if not.",
        camera, summary
    );
    let message = OutgoingMessage::with_media(caption, url);

    let sends = ctx.alert_chats.iter().map(|chat| {
        let message = message.clone();
        async move {
            let options = SendOptions::default();
            let sent = with_retry(&ctx.retry, || {
                ctx.provider.send_message(chat, &message, &options)
            })
            .await;
            (chat.clone(), sent)
        }
    });

    let mut dispatched = 0usize;
    for (chat, result) in join_all(sends).await {
        match result {
            Ok(message_id) => {
                ctx.feedback.register(&message_id, id, &chat).await;
                dispatched += 1;
            }
            Err(e) => warn!("Alert send to {} failed: {}", chat, e),
        }
    }

    if dispatched == 0 && !ctx.alert_chats.is_empty() {
        return Err(FlowError::TransientRemote(format!(
            "anomaly {} reached none of {} alert chats",
            id,
            ctx.alert_chats.len()
        )));
    }

    info!("Dispatched anomaly {} to {} chat(s)", id, dispatched);
    Ok(())
}

fn text_field<'a>(record: &'a JsonValue, name: &str) -> Result<&'a str, FlowError> {
    record
        .get(name)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| FlowError::Validation(format!("anomaly record missing {}", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::FeedbackConfig;
    use crate::provider::{MediaRef, ProviderError};
    use crate::store::{RecordStore, SqliteStore, Statement, ANOMALIES_TABLE};
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct StubProvider {
        sent: Mutex<Vec<(String, OutgoingMessage)>>,
        rate_limit_first: usize,
        calls: AtomicUsize,
    }

    impl StubProvider {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                rate_limit_first: 0,
                calls: AtomicUsize::new(0),
            }
        }

        fn rate_limited(times: usize) -> Self {
            Self {
                rate_limit_first: times,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl MessagingProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        async fn send_text(&self, chat_id: &str, text: &str) -> Result<String, ProviderError> {
            self.send_message(chat_id, &OutgoingMessage::text(text), &SendOptions::default())
                .await
        }

        async fn send_message(
            &self,
            chat_id: &str,
            message: &OutgoingMessage,
            _options: &SendOptions,
        ) -> Result<String, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.rate_limit_first {
                return Err(ProviderError::RateLimited(1));
            }
            self.sent
                .lock()
                .unwrap()
                .push((chat_id.to_string(), message.clone()));
            Ok(format!("sent-{}", n))
        }

        async fn save_file(&self, _media: &MediaRef) -> Result<PathBuf, ProviderError> {
            Err(ProviderError::MediaDownloadFailed("stub".to_string()))
        }
    }

    struct StubStorage;

    #[async_trait]
    impl ObjectStorage for StubStorage {
        async fn presigned_get_object(
            &self,
            bucket: &str,
            path: &str,
            expiry_secs: u64,
        ) -> Result<String, FlowError> {
            Ok(format!(
                "https://storage.test/{}/{}?expires={}",
                bucket, path, expiry_secs
            ))
        }

        async fn bucket_exists(&self, _bucket: &str) -> Result<bool, FlowError> {
            Ok(true)
        }

        async fn make_bucket(&self, _bucket: &str) -> Result<(), FlowError> {
            Ok(())
        }
    }

    async fn context(provider: Arc<StubProvider>) -> (AlertDispatchContext, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let (feedback, _events) = FeedbackAggregator::new(store.clone(), FeedbackConfig::default());
        let ctx = AlertDispatchContext {
            provider,
            storage: Arc::new(StubStorage),
            feedback,
            alert_chats: vec!["chat-a".to_string(), "chat-b".to_string()],
            bucket: "snapshots".to_string(),
            signed_url_expiry_secs: 3600,
            retry: RetryPolicy {
                max_retries: 3,
                backoff: Duration::from_millis(10),
            },
        };
        (ctx, store)
    }

    fn anomaly_record() -> JsonValue {
        json!({
            "id": "anom-7",
            "camera": "garage",
            "object_path": "2026/08/21/anom-7.jpg",
            "summary": "person near vehicle at 02:14",
            "detected_at": 1755740000000i64
        })
    }

    #[tokio::test]
    async fn test_dispatch_sends_to_every_chat_and_registers_feedback() {
        let provider = Arc::new(StubProvider::new());
        let (ctx, _store) = context(provider.clone()).await;

        dispatch_alert(&ctx, &anomaly_record()).await.unwrap();

        let sent = provider.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        let chats: Vec<&str> = sent.iter().map(|(chat, _)| chat.as_str()).collect();
        assert!(chats.contains(&"chat-a") && chats.contains(&"chat-b"));
        for (_, message) in &sent {
            assert!(message.text.contains("garage"));
            assert!(message.text.contains("person near vehicle"));
            assert_eq!(
                message.media_url.as_deref(),
                Some("https://storage.test/snapshots/2026/08/21/anom-7.jpg?expires=3600")
            );
        }

        assert!(ctx.feedback.is_tracked("sent-0").await);
        assert!(ctx.feedback.is_tracked("sent-1").await);
    }

    #[tokio::test]
    async fn test_malformed_record_rejected_before_any_send() {
        let provider = Arc::new(StubProvider::new());
        let (ctx, _store) = context(provider.clone()).await;

        let record = json!({"id": "anom-8", "summary": "no snapshot path"});
        let err = dispatch_alert(&ctx, &record).await.unwrap_err();

        assert!(matches!(err, FlowError::Validation(_)));
        assert!(provider.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limited_send_is_retried() {
        let provider = Arc::new(StubProvider::rate_limited(1));
        let (ctx, _store) = context(provider.clone()).await;

        dispatch_alert(&ctx, &anomaly_record()).await.unwrap();

        // Two chats, one extra call for the rate-limited first attempt.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(provider.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_listener_reacts_only_to_created_records() {
        let provider = Arc::new(StubProvider::new());
        let (ctx, store) = context(provider.clone()).await;

        let notifications = store.subscribe(ANOMALIES_TABLE);
        let handle = spawn_alert_listener(ctx, notifications);

        store
            .query(Statement::new(
                "INSERT INTO anomalies (id, camera, object_path, summary, detected_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                vec![
                    json!("anom-9"),
                    json!("porch"),
                    json!("2026/08/21/anom-9.jpg"),
                    json!("package removed"),
                    json!(1755740001000i64),
                ],
            ))
            .await
            .unwrap();
        store
            .query(Statement::new(
                "UPDATE anomalies SET summary = ?1 WHERE id = ?2",
                vec![json!("package removed (edited)"), json!("anom-9")],
            ))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        // The update must not have been re-announced.
        assert_eq!(provider.sent.lock().unwrap().len(), 2);
    }
}
